//! Fixture peer used by integration tests of the remote side.
//!
//! Exposes `count`, `do_call`, `do_online` and `do_offline` over stdio and
//! touches a marker file when the channel ends.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use pipelet::{Channel, ChannelConfig, LifecycleEvent, exit_code, init_tracing};

const TERMINATE_FILE_ENV: &str = "PIPELET_TERMINATE_FILE";
const DEFAULT_TERMINATE_FILE: &str = "/tmp/terminate";
const STARTUP_DELAY: Duration = Duration::from_millis(20);
const CALL_DELAY: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() {
    init_tracing();

    let terminate_file = std::env::var_os(TERMINATE_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TERMINATE_FILE));

    let channel = Channel::stdio(ChannelConfig::from_env());
    let (fatal_tx, mut fatal) = mpsc::unbounded_channel();
    install(&channel, terminate_file, fatal_tx.clone());
    spawn_init(channel.clone(), STARTUP_DELAY, fatal_tx);

    let outcome = tokio::select! {
        outcome = channel.closed() => outcome,
        Some(e) = fatal.recv() => {
            tracing::error!(error = %e, "Fatal error in fixture");
            process::exit(1);
        }
    };

    if let Err(ref e) = outcome {
        tracing::error!(error = %e, "Channel stopped with an error");
    }
    process::exit(exit_code(&outcome));
}

/// Errors from background work that must bring the fixture down.
type FatalSender = mpsc::UnboundedSender<anyhow::Error>;

/// Announce readiness after `delay`. A failed handshake is fatal.
fn spawn_init(channel: Channel, delay: Duration, fatal: FatalSender) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(e) = channel.init(true).await {
            let _ = fatal.send(anyhow::Error::new(e).context("init failed"));
        }
    });
}

/// Register the fixture actions.
fn install(channel: &Channel, terminate_file: PathBuf, fatal_tx: FatalSender) {
    let state = Arc::new(AtomicI64::new(0));

    {
        let ch = channel.clone();
        let state = Arc::clone(&state);
        channel.register("count", move |_| {
            let count = state.load(Ordering::SeqCst);
            ch.info("calling count", &json!({ "count": count }))?;
            Ok(json!(state.fetch_add(1, Ordering::SeqCst) + 1))
        });
    }

    {
        let ch = channel.clone();
        let state = Arc::clone(&state);
        channel.register("do_call", move |_| {
            let ch = ch.clone();
            let state = Arc::clone(&state);
            let fatal = fatal_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(CALL_DELAY).await;
                if let Err(e) = check_state(&ch, &state).await {
                    let _ = fatal.send(e);
                }
            });
            Ok(json!(true))
        });
    }

    {
        let ch = channel.clone();
        channel.register("do_online", move |_| {
            ch.online()?;
            Ok(json!(true))
        });
    }

    {
        let ch = channel.clone();
        channel.register("do_offline", move |_| {
            ch.offline()?;
            Ok(json!(true))
        });
    }

    let ch = channel.clone();
    channel.on(LifecycleEvent::End, move || {
        if let Err(e) = ch.error("terminating", &json!({})) {
            tracing::warn!(error = %e, "Could not send terminating log");
        }
        if let Err(e) = touch(&terminate_file) {
            tracing::warn!(error = %e, path = %terminate_file.display(), "Could not touch terminate file");
        }
    });
}

async fn check_state(channel: &Channel, state: &AtomicI64) -> anyhow::Result<()> {
    channel.debug("doing async request to the peer");
    let expected = state.load(Ordering::SeqCst);
    let response = channel
        .call("state_equal", vec![json!(expected)])
        .await
        .context("state_equal call failed")?;

    if response != Value::from(expected) {
        bail!("states not equal: expected {expected}, peer answered {response}");
    }
    Ok(())
}

fn touch(path: &Path) -> std::io::Result<()> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map(|_| ())
}
