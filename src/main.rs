//! ScreenLive - talk to a Gemini Live agent and optionally show it your screen
//!
//! Commands are read line by line from stdin.

#![forbid(unsafe_code)]

use anyhow::Context;
use screenlive::timeline::spawn_silent_driver;
use screenlive::{
    GeminiConnector, LiveConfig, LiveSession, SessionHandle, SessionSnapshot, SystemCapture,
    TimelineOutput,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const HELP: &str = "commands: start | stop | share | unshare | toggle | status | quit";

fn print_status(snapshot: &SessionSnapshot) {
    println!(
        "call: {} | agent: {} | screen: {}{}",
        snapshot.call,
        snapshot.activity,
        match (snapshot.screen_shared, snapshot.visible_to_agent) {
            (false, _) => "not shared",
            (true, true) => "shared, visible",
            (true, false) => "shared, hidden",
        },
        snapshot
            .last_error
            .as_deref()
            .map(|e| format!(" | error: {}", e))
            .unwrap_or_default()
    );
}

/// Print a status line whenever the call state or screen flags change.
async fn watch_state(handle: SessionHandle) {
    let mut rx = handle.subscribe();
    let mut last = rx.borrow().clone();
    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().clone();
        let headline_changed = current.call != last.call
            || current.activity != last.activity
            || current.screen_shared != last.screen_shared
            || current.visible_to_agent != last.visible_to_agent;
        if headline_changed {
            print_status(&current);
        }
        last = current;
    }
}

/// Returns false once the user asked to quit.
fn dispatch(handle: &SessionHandle, line: &str) -> anyhow::Result<bool> {
    match line.trim() {
        "" => {}
        "start" => handle.start_call()?,
        "stop" => handle.stop_call()?,
        "share" => handle.share_screen()?,
        "unshare" => handle.stop_screen_share()?,
        "toggle" => handle.toggle_visibility()?,
        "status" => {
            let snapshot = handle.snapshot();
            print_status(&snapshot);
            for entry in &snapshot.transcript {
                println!(
                    "  {:?}{}: {}",
                    entry.speaker,
                    if entry.is_final { "" } else { " (…)" },
                    entry.text
                );
            }
        }
        "quit" | "exit" => return Ok(false),
        other => println!("unknown command `{}`; {}", other, HELP),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("screenlive=info")),
        )
        .init();
    info!("Starting screenlive");

    let config = LiveConfig::from_env().context("loading configuration")?;

    let output = TimelineOutput::new(config.output_sample_rate);
    let (ended_tx, ended_rx) = mpsc::unbounded_channel();

    #[cfg(feature = "pulse")]
    let _driver = match screenlive::audio::spawn_pulse_driver(output.clone(), ended_tx.clone()) {
        Ok(_thread) => None,
        Err(e) => {
            warn!("PulseAudio playback unavailable ({}), agent audio will be silent", e);
            Some(spawn_silent_driver(output.clone(), ended_tx))
        }
    };
    #[cfg(not(feature = "pulse"))]
    let _driver = Some(spawn_silent_driver(output.clone(), ended_tx));

    let (handle, session) = LiveSession::spawn(config, SystemCapture, GeminiConnector, output, ended_rx);
    tokio::spawn(watch_state(handle.clone()));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match dispatch(&handle, &line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!("Session is gone: {}", e);
                break;
            }
        }
    }

    // stdin closed or quit
    let _ = handle.shutdown();
    session.await.context("session task failed")?;
    info!("Goodbye");
    Ok(())
}
