//! Messaging node
//!
//! Runs the message correlation engine with in-memory collaborators until
//! Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, overridden by BPMN_MSG_* variables
//! bpmn_messaging_node
//!
//! # YAML configuration and a few seeded messages
//! bpmn_messaging_node --config engine.yaml --demo 5
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bpmn_messaging::messaging::{MessageInstance, WaitingEventKind, WaitingMessageEvent};
use bpmn_messaging::telemetry::init_tracing;
use bpmn_messaging::{Collaborators, EngineConfig, EngineHandle, MessagingEngine};

#[derive(Parser)]
#[command(name = "bpmn_messaging_node")]
#[command(version = "0.1.0")]
#[command(about = "BPMN message correlation node")]
struct Cli {
    /// YAML configuration file
    #[arg(long, short, env = "BPMN_MSG_CONFIG")]
    config: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seed a start event and this many messages for it
    #[arg(long, default_value_t = 0)]
    demo: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = match &cli.config {
        Some(path) => match EngineConfig::load_from_file(path) {
            Ok(config) => config.with_env_overrides(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::from_env(),
    };

    let engine = match MessagingEngine::start(config.clone(), Collaborators::in_memory(&config)) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Failed to start engine");
            return ExitCode::FAILURE;
        }
    };

    if cli.demo > 0 {
        if let Err(e) = seed_demo(&engine, cli.demo).await {
            tracing::error!(error = %format!("{:#}", e), "Failed to seed demo data");
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Unable to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested");
    engine.shutdown().await;
    ExitCode::SUCCESS
}

async fn seed_demo(engine: &EngineHandle, messages: usize) -> anyhow::Result<()> {
    engine
        .messages()
        .register_waiting_event(WaitingMessageEvent::new(
            WaitingEventKind::StartEvent,
            "order-placed",
            "fulfilment",
            "order-received",
        ))
        .await?;
    for i in 0..messages {
        engine
            .messages()
            .send_message(
                MessageInstance::new("order-placed", "fulfilment")
                    .with_payload("order_id", format!("demo-{}", i)),
            )
            .await?;
    }
    tracing::info!(messages, "Demo data seeded");
    Ok(())
}
