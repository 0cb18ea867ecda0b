//! Two courier nodes sharing one in-process store.
//!
//! A client joins node A in pull mode and subscribes to a subject. Node B
//! publishes to that subject; node A's delivery loop picks the events up
//! from the shared queue and prints them as JSON lines.

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use courier_rs::Node;
use courier_rs::config::CourierConfig;
use courier_rs::core::FetchOutcome;
use courier_rs::protocol::{ClientAdapter, Event, Mode, TransportError, fields, kinds};
use courier_rs::store::{MemoryStore, SharedStore};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;

/// Command-line options for the cluster demo.
#[derive(Parser)]
#[command(name = "courier-cluster-demo", version)]
struct Cli {
    /// Optional path to a courier.json5 config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Subject the client subscribes to
    #[arg(long, default_value = "/chat")]
    subject: String,
    /// Number of messages node B publishes
    #[arg(long, default_value_t = 3)]
    messages: usize,
}

/// Writes every event to stdout as one JSON object per line.
struct StdoutAdapter;

#[async_trait]
impl ClientAdapter for StdoutAdapter {
    async fn start(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn push(&mut self, event: &Event) -> Result<(), TransportError> {
        let line =
            serde_json::to_string(event).map_err(|err| TransportError::Encode(err.to_string()))?;
        println!("{line}");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        println!("-- response closed");
        Ok(())
    }
}

fn node_config(base: &CourierConfig, node_id: &str) -> CourierConfig {
    let mut config = base.clone();
    config.cluster.node_id = Some(node_id.to_string());
    config
}

/// Entry point for the cluster demo.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_rs::init_logging();

    let cli = Cli::parse();
    let base = if let Some(path) = cli.config.as_ref() {
        info!("loading config from path: {}", path.display());
        CourierConfig::load_from_path(path).context("failed to load config")?
    } else {
        let cwd = std::env::current_dir().context("cwd")?;
        let layered = CourierConfig::load_layered(&cwd).context("failed to load layered config")?;
        debug!("layered config loaded (layers={})", layered.layers.len());
        layered.config
    };

    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let node_a = Node::new(node_config(&base, "node-a"), Arc::clone(&store))
        .context("invalid config for node-a")?;
    let node_b = Node::new(node_config(&base, "node-b"), Arc::clone(&store))
        .context("invalid config for node-b")?;
    node_a.start();
    node_b.start();

    let session = node_a
        .manager()
        .create_session(&Event::new(kinds::JOIN_LISTEN))
        .await
        .context("failed to create session")?;
    node_a.manager().add_session(Arc::clone(&session));
    session.subscriber().start();
    session
        .negotiate_mode(Some(Mode::Pull))
        .await
        .context("failed to set mode")?;
    session
        .subscriber()
        .add_subscription(&cli.subject, Some("demo"))
        .await
        .context("failed to subscribe")?;
    info!(
        "client joined (node_id={}, session_id={}, subject={})",
        node_a.node_id(),
        session.id(),
        cli.subject
    );

    for n in 1..=cli.messages {
        let event = Event::data(cli.subject.as_str())
            .with_field("text", format!("message {n} from {}", node_b.node_id()));
        let delivered = node_b
            .dispatcher()
            .multicast(&event)
            .await
            .context("multicast failed")?;
        debug!("published (n={}, delivered={})", n, delivered);
    }

    let mut adapter = StdoutAdapter;
    let refresh_url = session.subscriber().refresh_url("/courier");
    let response = Event::new(kinds::REFRESH_ACK).with_field(fields::ID, session.id());
    let outcome = session
        .subscriber()
        .fetch_events(&mut adapter, &response, &refresh_url)
        .await;
    info!("fetch finished (outcome={:?})", outcome);
    if outcome != FetchOutcome::Refreshed {
        anyhow::bail!("client connection closed unexpectedly");
    }

    print!("{}", node_a.manager().status());
    node_b.stop().await;
    node_a.stop().await;
    Ok(())
}
