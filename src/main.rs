mod cli;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command};
use spirebridge::demo::DemoGame;
use spirebridge::log::{LogEvent, SessionLog};
use spirebridge::{Bridge, BridgeConfig, BridgeEvent, EventSink, SupervisorSettings};

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .spirebridge/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<22} {value}\n"));
}

fn render_config_human(config: &BridgeConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Advisor\n");
    if config.advisor.command.is_empty() {
        push_kv(&mut output, "command", "(none)");
    } else {
        push_kv(&mut output, "command", &config.advisor.command);
    }
    push_kv(&mut output, "run_at_start", config.advisor.run_at_start);
    push_kv(
        &mut output,
        "handshake_timeout",
        format!("{}s", config.advisor.handshake_timeout_secs),
    );
    push_kv(
        &mut output,
        "grace_period",
        format!("{}ms", config.advisor.grace_period_millis),
    );
    push_kv(&mut output, "error_log", &config.advisor.error_log);
    push_kv(&mut output, "trace_io", config.advisor.trace_io);
    output.push('\n');

    output.push_str("Broadcast\n");
    push_kv(&mut output, "enabled", config.broadcast.enabled);
    push_kv(&mut output, "host", &config.broadcast.host);
    push_kv(&mut output, "port", config.broadcast.port);
    output.push('\n');

    output.push_str("Overlay\n");
    push_kv(&mut output, "enabled", config.overlay.enabled);
    output.push('\n');

    output.push_str("Frame\n");
    push_kv(&mut output, "rate", format!("{}Hz", config.frame.rate_hz));
    output.push('\n');

    output.push_str("Session Log\n");
    push_kv(
        &mut output,
        "path",
        config.log.path.as_deref().unwrap_or("(disabled)"),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &BridgeConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "advisor": {
            "command": &config.advisor.command,
            "run_at_start": config.advisor.run_at_start,
            "handshake_timeout_secs": config.advisor.handshake_timeout_secs,
            "grace_period_millis": config.advisor.grace_period_millis,
            "error_log": &config.advisor.error_log,
            "trace_io": config.advisor.trace_io
        },
        "broadcast": {
            "enabled": config.broadcast.enabled,
            "host": &config.broadcast.host,
            "port": config.broadcast.port
        },
        "overlay": {
            "enabled": config.overlay.enabled
        },
        "frame": {
            "rate_hz": config.frame.rate_hz
        },
        "log": {
            "path": config.log.path.clone()
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn frame_interval(rate_hz: u32) -> Duration {
    Duration::from_secs(1) / rate_hz.max(1)
}

struct RunOptions {
    command: Option<String>,
    port: Option<u16>,
    no_broadcast: bool,
    frames: Option<u64>,
}

fn drain_events(rx: &mpsc::Receiver<BridgeEvent>, session_log: Option<&SessionLog>) {
    for event in rx.try_iter() {
        if let Some(log) = session_log {
            if let Err(e) = log.log(LogEvent::from(&event)) {
                warn!("failed to write session log: {e:#}");
            }
        }
    }
}

fn run_demo(
    options: RunOptions,
    config: &BridgeConfig,
    config_path: Option<&Path>,
    cwd: &Path,
) -> Result<()> {
    let session_log = match config.log.path.as_deref() {
        Some(path) => {
            let path = BridgeConfig::resolve_path(config_path, cwd, path);
            let log = SessionLog::new(&path)?;
            info!(path = %log.path().display(), "writing session log");
            Some(log)
        }
        None => None,
    };

    let mut settings = SupervisorSettings::from(&config.advisor);
    settings.error_log = BridgeConfig::resolve_path(config_path, cwd, &config.advisor.error_log);
    if let Some(ref command) = options.command {
        settings.command = command.clone();
    }
    let launch_advisor = options.command.is_some() || config.advisor.run_at_start;
    let advisor_label = (!settings.command.is_empty()).then(|| settings.command.clone());

    let (tx, rx) = mpsc::channel();
    let mut bridge = Bridge::new(settings, EventSink::new(tx));
    bridge.store().set_enabled(config.overlay.enabled);

    let broadcast_port = if config.broadcast.enabled && !options.no_broadcast {
        let port = options.port.unwrap_or(config.broadcast.port);
        if !bridge.start_broadcast(&config.broadcast.host, port) {
            warn!(port, "viewer server did not start; continuing without viewers");
        }
        bridge.server().and_then(|s| s.local_addr()).map(|a| a.port())
    } else {
        None
    };

    if let Some(ref log) = session_log {
        log.log(LogEvent::SessionStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            advisor: advisor_label,
            broadcast_port,
        })?;
    }

    if launch_advisor && !bridge.start_advisor(None) {
        warn!(
            error_log = %bridge.supervisor().settings().error_log.display(),
            "advisor did not start; continuing without it"
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .ok();

    let interval = frame_interval(config.frame.rate_hz);
    let mut game = DemoGame::new();
    info!(rate_hz = config.frame.rate_hz, "frame loop running (Ctrl-C to stop)");

    while !stop.load(Ordering::Relaxed) {
        let started = Instant::now();
        bridge.tick(&mut game);
        drain_events(&rx, session_log.as_ref());

        if options.frames.is_some_and(|limit| bridge.frames() >= limit) {
            break;
        }
        std::thread::sleep(interval.saturating_sub(started.elapsed()));
    }

    bridge.shutdown();
    drain_events(&rx, session_log.as_ref());
    if let Some(ref log) = session_log {
        log.log(LogEvent::SessionEnded {
            frames: bridge.frames(),
        })?;
    }
    info!(frames = bridge.frames(), turn = game.turn(), "bridge stopped");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "spirebridge=warn",
        0 => "spirebridge=info",
        1 => "spirebridge=debug",
        _ => "spirebridge=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = BridgeConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .spirebridge/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run {
            command,
            port,
            no_broadcast,
            frames,
        } => {
            let options = RunOptions {
                command,
                port,
                no_broadcast,
                frames,
            };
            run_demo(options, &config, config_path.as_deref(), &cwd)?;
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
    }

    Ok(())
}
