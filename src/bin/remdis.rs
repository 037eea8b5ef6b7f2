//! Headless dialogue host with a stdin/stdout JSON protocol.
//!
//! Reads `UiCommand` messages as newline-delimited JSON from stdin, runs the
//! full module set (dialogue controller, Text-VAP, intention watchdog, UI
//! bridge) over an in-process bus, and writes `UiEvent` messages to stdout.
//!
//! All tracing output goes to stderr so that stdout remains a clean JSON
//! protocol channel.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use remdis::bus::MessageBus;
use remdis::config::SystemConfig;
use remdis::dialogue::DialogueController;
use remdis::error::{RemdisError, Result};
use remdis::intention::IntentionModule;
use remdis::llm::ChatGptAdapter;
use remdis::module::ModuleRunner;
use remdis::prompts::PromptSet;
use remdis::text_vap::TextVapModule;
use remdis::ui::{UiBridge, UiCommand, UserInputPublisher};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => {
            info!("remdis shut down cleanly");
        }
        Err(e) => {
            tracing::error!("remdis failed: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn load_config() -> Result<SystemConfig> {
    let mut args = std::env::args().skip(1);
    let mut path: Option<PathBuf> = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().ok_or_else(|| {
                    RemdisError::ConfigInvalid("--config requires a path".to_owned())
                })?;
                path = Some(PathBuf::from(value));
            }
            other => {
                return Err(RemdisError::ConfigInvalid(format!(
                    "unknown argument: {other}"
                )));
            }
        }
    }
    match path {
        Some(p) => SystemConfig::from_file(&p),
        None => {
            let p = SystemConfig::default_path();
            if p.exists() {
                SystemConfig::from_file(&p)
            } else {
                Ok(SystemConfig::default())
            }
        }
    }
}

async fn run() -> Result<()> {
    let config = load_config()?;
    let prompts = PromptSet::load(config.dialogue.prompt_dir.as_deref())?;
    let generator = Arc::new(ChatGptAdapter::new(&config.chatgpt));

    let bus = MessageBus::new(&config.bus);
    let cancel = CancellationToken::new();
    let runner = ModuleRunner::new(bus.clone(), cancel.clone(), config.runtime.shutdown_drain());

    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let handles = vec![
        runner.spawn(DialogueController::new(
            config.clone(),
            prompts.clone(),
            Arc::clone(&generator) as _,
        )),
        runner.spawn(TextVapModule::new(
            config.clone(),
            prompts,
            Arc::clone(&generator) as _,
        )),
        runner.spawn(IntentionModule::new(config.clone())),
        runner.spawn(UiBridge::new(ui_tx)),
    ];
    info!("remdis started ({} modules)", handles.len());

    // Events out: one JSON object per line on stdout.
    let writer = tokio::spawn(async move {
        use std::io::Write;
        while let Some(event) = ui_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    let mut out = std::io::stdout().lock();
                    let _ = writeln!(out, "{line}");
                    let _ = out.flush();
                }
                Err(e) => warn!("event serialization failed: {e}"),
            }
        }
    });

    // Commands in: typed user input flows through the ASR surface.
    let stdin_cancel = cancel.clone();
    let mut publisher = UserInputPublisher::new(bus.clone());
    let stdin_task = tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                () = stdin_cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<UiCommand>(line) {
                            Ok(command) => publisher.publish(command).await,
                            Err(e) => warn!("ignoring malformed command: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read error: {e}");
                        break;
                    }
                },
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = stdin_task => info!("input closed, shutting down"),
    }

    cancel.cancel();
    bus.close();
    // Stop modules in reverse start order.
    for handle in handles.into_iter().rev() {
        handle.shutdown();
        handle.join().await;
    }
    let _ = writer.await;
    Ok(())
}
