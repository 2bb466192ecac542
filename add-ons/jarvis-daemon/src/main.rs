//! JARVIS voice daemon
//!
//! Runs one voice session against the real collaborators: Gemini for replies
//! and speech, rodio for playback, espeak-ng as the local voice. Recognition
//! results and UI actions are read from stdin.

mod console;

use console::ConsoleRecognizer;
use jarvis_voice::{
    ControllerDeps, ControllerHandle, EspeakSynthesizer, GeminiClient, HistoryStore,
    LocalSynthesizer, RodioDeviceFactory, SessionSnapshot, SledHistoryStore, TurnController,
    VoiceConfig, VoiceResult,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "commands: /activate /deactivate /stop /pause /online /offline \
/type <text> /theme <name> /quit; ~text = interim, !code = recognition error, \
anything else is heard as speech";

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[jarvis-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "jarvis daemon failed");
        std::process::exit(1);
    }
}

async fn run() -> VoiceResult<()> {
    let config = VoiceConfig::load()?;
    let generator = Arc::new(GeminiClient::new(&config)?);

    let local: Option<Arc<dyn LocalSynthesizer>> =
        match EspeakSynthesizer::detect(&config.fallback).await {
            Ok(espeak) => Some(Arc::new(espeak)),
            Err(e) => {
                tracing::warn!(error = %e, "no local voice; fallback speech disabled");
                None
            }
        };

    // sled is single-writer; one daemon per storage path.
    let store = Arc::new(SledHistoryStore::open_path(&config.session.storage_path)?);
    match store.load_theme() {
        Ok(theme) => {
            tracing::info!(theme = theme.as_deref().unwrap_or("default"), "theme restored")
        }
        Err(e) => tracing::warn!(error = %e, "theme not loaded"),
    }

    let recognizer = ConsoleRecognizer::new();
    tracing::info!(
        storage_path = %config.session.storage_path,
        wake_phrase = %config.wake.phrase,
        "jarvis daemon started"
    );

    let handle = TurnController::spawn(
        config,
        ControllerDeps {
            recognizer: Arc::new(recognizer.clone()),
            generator: generator.clone(),
            synthesizer: generator,
            local,
            devices: Arc::new(RodioDeviceFactory),
            store: Some(store.clone() as Arc<dyn HistoryStore>),
        },
    )?;

    let watcher = tokio::spawn(report(handle.subscribe()));
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !on_line(&line, &handle, &recognizer, store.as_ref()) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    watcher.abort();
    Ok(())
}

/// Returns false when the user asked to quit.
fn on_line(
    line: &str,
    handle: &ControllerHandle,
    recognizer: &ConsoleRecognizer,
    store: &dyn HistoryStore,
) -> bool {
    let line = line.trim();
    let (command, rest) = match line.strip_prefix('/') {
        Some(cmd) => match cmd.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (cmd, ""),
        },
        None => {
            if let Some(item) = ConsoleRecognizer::parse(line) {
                if !recognizer.feed(item) {
                    tracing::debug!("no recognition session listening; line dropped");
                }
            }
            return true;
        }
    };

    let sent = match command {
        "activate" => handle.activate(),
        "deactivate" => handle.deactivate(),
        "stop" => handle.stop_voice(),
        "pause" => handle.toggle_pause(),
        "online" => handle.set_online(true),
        "offline" => handle.set_online(false),
        "type" => handle.submit(rest),
        "theme" => {
            if rest.is_empty() {
                println!("usage: /theme <name>");
            } else if let Err(e) = store.save_theme(rest) {
                tracing::warn!(error = %e, "theme not saved");
            } else {
                tracing::info!(theme = rest, "theme saved");
            }
            Ok(())
        }
        "quit" | "exit" => return false,
        _ => {
            println!("{}", HELP);
            Ok(())
        }
    };
    if let Err(e) = sent {
        tracing::warn!(error = %e, "signal not delivered");
        return false;
    }
    true
}

/// Print state changes and new replies as they are published.
async fn report(mut snapshots: tokio::sync::watch::Receiver<SessionSnapshot>) {
    let mut last = snapshots.borrow().clone();
    while snapshots.changed().await.is_ok() {
        let current = snapshots.borrow_and_update().clone();
        if current.state != last.state || current.transcript != last.transcript {
            println!("[{}] {}", current.state, current.transcript);
        }
        if current.history.len() > last.history.len() {
            if let Some(message) = current.history.last() {
                if !message.sources.is_empty() {
                    println!("  sources: {}", message.sources.join(", "));
                }
            }
        }
        if current.paused != last.paused {
            println!("  playback {}", if current.paused { "paused" } else { "resumed" });
        }
        last = current;
    }
}
