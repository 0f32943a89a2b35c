pub mod config;
pub mod console;
pub mod controller;
pub mod error;
pub mod mapping;
pub mod mqtt;

use crate::config::{AppConfig, Cli, InputMode};
use crate::console::{RawSafeWriter, StatusSink, TerminalConsole};
use crate::controller::dispatch::DispatchLoop;
use crate::controller::key_reader::{KeySource, StdinKeys, TerminalKeys};
use crate::mapping::keyboard::KeyboardMapping;
use crate::mqtt::events::ConsoleEvents;
use crate::mqtt::mqtt_handler::MqttSession;
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use std::io::IsTerminal;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Exit status after an external interrupt (128 + SIGINT)
const INTERRUPTED_STATUS: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup()?;

    let config = AppConfig::load(&cli).await?;
    setup_logging_env(config.log_level()?);
    info!(
        "Broker {}, topic '{}', input {:?}",
        config.broker.address, config.control.topic, config.control.input
    );

    let console: Arc<dyn StatusSink> = Arc::new(TerminalConsole::new());
    let events = Arc::new(ConsoleEvents::new(
        console.clone(),
        config.broker.address.clone(),
    ));

    // Without the initial connection there is nothing to control
    let session = MqttSession::connect(config.session_settings(), events.clone())
        .await
        .wrap_err_with(|| format!("Could not connect to broker {}", config.broker.address))?;
    let session = Arc::new(session);
    console.status(&format!(
        "Session '{}' on {}",
        session.client_id(),
        session.address()
    ));

    let topic = config.control.topic.clone();
    if let Err(e) = session.subscribe(&topic, events) {
        warn!("Continuing without echoes: {}", e);
        console.status(&format!("Not subscribed to '{topic}': {e}"));
    }

    let mapping = KeyboardMapping::default_config();
    console.status(&format!("Drive the robot with {}", mapping.legend()));

    let keys = open_key_source(config.control.input);
    let dispatch = DispatchLoop::new(keys, session.clone(), mapping, topic, console.clone());

    tokio::select! {
        report = dispatch.run() => {
            console.status(&format!(
                "Bye: {} command(s) sent, {} dropped ({})",
                report.published, report.failed, report.exit
            ));
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            // The pending key read cannot be cancelled; tear down here and leave
            warn!("Interrupted, closing the session");
            console.status("Interrupted.");
            session.disconnect();
            session.close().await;
            let _ = crossterm::terminal::disable_raw_mode();
            std::process::exit(INTERRUPTED_STATUS);
        }
    }
}

fn open_key_source(mode: InputMode) -> Box<dyn KeySource> {
    let use_terminal = match mode {
        InputMode::Terminal => true,
        InputMode::Stdin => false,
        InputMode::Auto => std::io::stdin().is_terminal(),
    };

    if use_terminal {
        info!("Reading keys from the terminal");
        Box::new(TerminalKeys::new())
    } else {
        info!("Reading keys from stdin");
        Box::new(StdinKeys::new())
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(RawSafeWriter::stderr)
        .init();
}
