use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use common_infra::{metrics, shutdown, telemetry, BoxError};
use peer_client::{ClientConfig, ClientDeps, ClientSettings, Identity, SessionClient};
use session_store::{RemoteStore, SessionKind};
use signaling::{LoopbackFactory, PeerEvent, StaticMedia};
use tokio::sync::broadcast;
use tracing::info;

/// Two scripted participants: create, join, negotiate peer links,
/// optionally chat, then tear down. Runs against the in-memory backends
/// unless a store URL is configured.
#[derive(Debug, Parser)]
#[command(name = "peer-client", about = "Loopback session demo")]
struct Args {
    #[arg(long, value_enum, default_value_t = KindArg::Voice)]
    kind: KindArg,

    #[arg(long, default_value_t = 2)]
    capacity: u32,

    #[arg(long, default_value = "alice")]
    host: String,

    #[arg(long, default_value = "bob")]
    guest: String,

    /// JSON settings file; environment variables override its values.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Voice,
    Chat,
}

impl From<KindArg> for SessionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Voice => SessionKind::Voice,
            KindArg::Chat => SessionKind::Chat,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    telemetry::init("peer-client");
    metrics::session_metrics().on_startup();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => ClientSettings::from_file(path)?,
        None => ClientSettings::default(),
    };
    settings.merge_env()?;
    let config = settings.into_config();
    let deps = build_deps(&config);

    match shutdown::run_with_ctrl_c(run_demo(args, config, deps)).await {
        Some(result) => result,
        None => Ok(()),
    }
}

fn build_deps(config: &ClientConfig) -> ClientDeps {
    match &config.store_url {
        Some(url) => {
            let mut store = RemoteStore::new(url);
            if let Some(token) = &config.store_token {
                store = store.with_auth_token(token.clone());
            }
            let store = Arc::new(store);
            ClientDeps {
                store: store.clone(),
                mailbox: store.clone(),
                chat: store,
                factory: Arc::new(LoopbackFactory::new()),
                media: Arc::new(StaticMedia::granting()),
            }
        }
        None => ClientDeps::in_memory(),
    }
}

async fn run_demo(args: Args, config: ClientConfig, deps: ClientDeps) -> Result<(), BoxError> {
    let host = SessionClient::new(
        Identity::new(&args.host, titlecase(&args.host)),
        deps.clone(),
        config.clone(),
    );
    let guest = SessionClient::new(
        Identity::new(&args.guest, titlecase(&args.guest)),
        deps,
        config,
    );

    let hosted = host.create_session(args.kind.into(), args.capacity).await?;
    info!(session = hosted.id(), "session created, waiting for a guest");
    let mut host_events = hosted.peer_events();

    let joined = guest.join_session(hosted.id()).await?;
    let mut guest_events = joined.peer_events();

    wait_connected(&mut host_events, &args.guest).await?;
    wait_connected(&mut guest_events, &args.host).await?;
    info!("peer links established on both sides");

    if matches!(args.kind, KindArg::Chat) {
        let mut inbox = hosted.chat().subscribe().await?;
        joined.chat().send(&args.guest, "hello from the demo").await?;
        if let Some(message) = inbox.recv().await {
            info!(from = %message.display_name, text = %message.text, "chat delivered");
        }
    }

    let after_leave = joined.leave().await?;
    info!(status = ?after_leave.status, "guest left");
    let ended = hosted.end_for_all().await?;
    info!(status = ?ended.status, "session ended");
    Ok(())
}

async fn wait_connected(
    events: &mut broadcast::Receiver<PeerEvent>,
    peer: &str,
) -> Result<(), BoxError> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(PeerEvent::Connected(user)) if user == peer => return Ok(()),
                Ok(_) => continue,
                Err(err) => return Err(BoxError::from(err)),
            }
        }
    })
    .await
    .map_err(|_| format!("timed out waiting for a link to {peer}"))?
}

fn titlecase(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
