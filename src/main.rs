// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use macrocast::hotkey::HotkeyCommand;
use macrocast::listener::TerminalListener;
use macrocast::pty::PtyActuator;
use macrocast::{
    DispatchPolicy, HotkeyDispatcher, InputActuator, PlaybackConfig, PlaybackController,
    PlaybackEvent, TracingActuator, parse_script,
};

fn parse_size(s: &str) -> std::result::Result<(u16, u16), String> {
    let (cols, rows) = s
        .split_once(['x', ':'])
        .ok_or_else(|| format!("expected COLSxROWS, got '{}'", s))?;
    let cols = cols.parse().map_err(|_| format!("bad column count '{}'", cols))?;
    let rows = rows.parse().map_err(|_| format!("bad row count '{}'", rows))?;
    Ok((cols, rows))
}

#[derive(Parser, Debug)]
#[command(name = "macrocast", version, about = "Replay recorded keyboard and mouse macros")]
struct Cli {
    /// Script file to play
    script: PathBuf,

    /// Playback rate; 2.0 plays twice as fast
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Random variation applied to each delay, as a fraction (0.0 to 1.0)
    #[arg(long, default_value_t = 0.0)]
    jitter: f64,

    /// Override the script's loop count (0 loops until stopped)
    #[arg(long)]
    loops: Option<u32>,

    #[arg(long, default_value = "Ctrl+Q")]
    stop_key: String,

    #[arg(long, default_value = "Ctrl+P")]
    pause_key: String,

    /// What to do when an action cannot be delivered: continue or abort
    #[arg(long, default_value = "continue")]
    on_dispatch_error: DispatchPolicy,

    /// Program to drive (defaults to $SHELL)
    #[arg(long)]
    shell: Option<String>,

    /// Terminal size as COLSxROWS
    #[arg(long, default_value = "80x24", value_parser = parse_size)]
    size: (u16, u16),

    /// Log actions instead of sending them anywhere
    #[arg(long)]
    dry_run: bool,

    /// Print playback events as JSON lines
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stderr keeps the PTY's output on stdout clean
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let source = std::fs::read_to_string(&cli.script)
        .with_context(|| format!("Failed to read {}", cli.script.display()))?;
    let mut script = parse_script(&source)
        .with_context(|| format!("Failed to parse {}", cli.script.display()))?;
    if let Some(loops) = cli.loops {
        script.set_loop_count(loops)?;
    }
    script.activate().context("Script is not playable")?;

    let config = PlaybackConfig {
        speed: cli.speed,
        jitter: cli.jitter,
        dispatch_policy: cli.on_dispatch_error,
        ..Default::default()
    };

    let actuator: Arc<dyn InputActuator> = if cli.dry_run {
        Arc::new(TracingActuator)
    } else {
        let shell = cli
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let (cols, rows) = cli.size;
        Arc::new(PtyActuator::spawn(&shell, cols, rows)?)
    };

    let controller = PlaybackController::builder(Arc::clone(&actuator))
        .config(config)
        .build()?;

    let printer = cli.json.then(|| {
        let mut events = controller.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => warn!("could not encode event: {}", e),
                        }
                        if matches!(event, PlaybackEvent::Stopped { .. }) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!("dropped {} events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let hotkeys = HotkeyDispatcher::new();
    // Ctrl+C arrives as a key, not SIGINT, once the terminal is in raw mode
    for (spec, command) in [
        (cli.stop_key.as_str(), HotkeyCommand::Stop),
        (cli.pause_key.as_str(), HotkeyCommand::TogglePause),
        ("Ctrl+C", HotkeyCommand::Stop),
    ] {
        if !hotkeys.register(spec, command) {
            warn!("hotkey {} not registered", spec);
        }
    }
    let hotkey_task = controller.listen(hotkeys.subscribe());
    let listener = if std::io::stdin().is_terminal() {
        Some(TerminalListener::spawn(hotkeys.clone())?)
    } else {
        None
    };

    let on_signal = controller.clone();
    ctrlc::set_handler(move || {
        on_signal.stop();
    })?;

    controller.load(script)?;
    controller.play()?;
    info!(
        "playing {} (stop: {}, pause: {})",
        cli.script.display(),
        cli.stop_key,
        cli.pause_key
    );
    controller.wait_until_stopped().await;

    if let Some(listener) = listener {
        listener.shutdown();
    }
    hotkey_task.abort();

    let stats = controller.stats();
    info!(
        "done: {} executed, {} skipped, {} repeated, {} failed",
        stats.executed, stats.skipped, stats.repeated, stats.failed
    );
    let faults = controller.faults().count();
    if faults > 0 {
        warn!("{} faults recorded during playback", faults);
    }

    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(())
}
