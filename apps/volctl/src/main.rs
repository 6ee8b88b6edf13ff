use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use shared::domain::VolumeSnapshot;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::{broadcast, watch},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use volume_backend::SoftwareVolumeBackend;
use volume_core::{SyncController, SyncEvent};

mod config;
mod input;

use config::{load_settings, Settings};
use input::{parse_command, ViewCommand};

#[derive(Parser, Debug)]
#[command(about = "Keep a volume control in sync with the output mixer")]
struct Args {
    /// config file (defaults to ./volctl.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,
    /// level shown and applied before the mixer answers
    #[arg(short, long, allow_negative_numbers = true)]
    initial_volume: Option<i32>,
    #[arg(long, allow_negative_numbers = true)]
    min: Option<i32>,
    #[arg(long, allow_negative_numbers = true)]
    max: Option<i32>,
    #[arg(long)]
    query_timeout_ms: Option<u64>,
    /// do not re-broadcast levels written by this control
    #[arg(long)]
    no_echo: bool,
    /// render snapshots and events as JSON lines
    #[arg(long)]
    json: bool,
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = self.initial_volume {
            settings.initial_volume = v;
        }
        if let Some(v) = self.min {
            settings.min_volume = v;
        }
        if let Some(v) = self.max {
            settings.max_volume = v;
        }
        if let Some(v) = self.query_timeout_ms {
            settings.query_timeout_ms = v;
        }
        if self.no_echo {
            settings.echo_writes = false;
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut settings = load_settings(args.config.as_deref())?;
    args.apply(&mut settings);
    let sync_config = settings
        .sync_config()
        .context("invalid volume range in settings")?;

    let backend = Arc::new(
        SoftwareVolumeBackend::new(f64::from(settings.initial_level().0))
            .with_echo_writes(settings.echo_writes)
            .with_key_step(settings.key_step),
    );

    let (events, events_rx) = broadcast::channel(256);
    let event_task = tokio::spawn(report_events(events_rx, args.json));
    let mut controller =
        SyncController::start_with_events(backend.clone(), sync_config, events).await;
    let render_task = tokio::spawn(render(controller.watch(), args.json));
    info!(
        min = controller.range().min().0,
        max = controller.range().max().0,
        "volctl: ready"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                warn!(error = %err, "volctl: ignoring input");
                continue;
            }
        };
        if !execute(command, &controller, &backend, args.json).await? {
            break;
        }
    }

    controller.shutdown().await;
    render_task.abort();
    event_task.abort();
    Ok(())
}

/// Returns `false` when the view should close.
async fn execute(
    command: ViewCommand,
    controller: &SyncController,
    backend: &SoftwareVolumeBackend,
    json: bool,
) -> Result<bool> {
    match command {
        ViewCommand::Set(raw) => controller
            .on_user_input(raw)
            .context("volume controller stopped")?,
        ViewCommand::Up(presses) => press_keys(backend, presses, 1).await,
        ViewCommand::Down(presses) => press_keys(backend, presses, -1).await,
        ViewCommand::Emit(raw) => backend.emit(raw).await,
        ViewCommand::Restart => backend.restart_stream().await,
        ViewCommand::Offline => backend.set_available(false).await,
        ViewCommand::Online => backend.set_available(true).await,
        ViewCommand::Show => print_snapshot(&controller.snapshot(), json),
        ViewCommand::Quit => return Ok(false),
    }
    Ok(true)
}

async fn press_keys(backend: &SoftwareVolumeBackend, presses: u32, direction: i32) {
    for _ in 0..presses {
        if let Err(err) = backend.nudge(direction).await {
            warn!(error = %err, "volctl: volume key ignored");
            return;
        }
    }
}

async fn render(mut snapshots: watch::Receiver<VolumeSnapshot>, json: bool) {
    loop {
        let snapshot = *snapshots.borrow_and_update();
        print_snapshot(&snapshot, json);
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}

fn print_snapshot(snapshot: &VolumeSnapshot, json: bool) {
    if !json {
        println!("volume: {}", snapshot.level);
        return;
    }
    match serde_json::to_string(snapshot) {
        Ok(line) => println!("{line}"),
        Err(err) => warn!(error = %err, "volctl: failed to encode snapshot"),
    }
}

async fn report_events(mut events: broadcast::Receiver<SyncEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, "volctl: failed to encode event"),
            },
            Ok(event) => info!(?event, "volctl: sync event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "volctl: dropped sync events")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_and_env() {
        let mut settings = Settings::from_toml(
            "min_volume = -55\nmax_volume = -5\nquery_timeout_ms = 900\necho_writes = true\n",
        )
        .expect("parse");
        settings.apply_env([
            ("VOLCTL__MIN_VOLUME".to_string(), "-58".to_string()),
            ("VOLCTL__INITIAL_VOLUME".to_string(), "-30".to_string()),
        ]);

        let args = Args::parse_from([
            "volctl",
            "--min",
            "-60",
            "--no-echo",
            "--initial-volume",
            "-7",
        ]);
        args.apply(&mut settings);

        assert_eq!(settings.min_volume, -60);
        assert_eq!(settings.initial_volume, -7);
        assert!(!settings.echo_writes);
        assert_eq!(settings.max_volume, -5);
        assert_eq!(settings.query_timeout_ms, 900);
    }

    #[test]
    fn absent_flags_leave_settings_alone() {
        let mut settings = Settings::from_toml("max_volume = -5").expect("parse");
        let before = settings.clone();
        Args::parse_from(["volctl"]).apply(&mut settings);
        assert_eq!(settings, before);
    }
}
