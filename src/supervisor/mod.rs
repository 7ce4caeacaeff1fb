//! Advisor process supervision.
//!
//! Owns the one external advisor process: launches it with stdin/stdout piped
//! through a [`StdioPump`] and stderr appended to an error log, waits for its
//! handshake line, checks liveness once per frame, and tears it down on stop
//! or restart. Restarts are never automatic; a persistently broken command
//! would otherwise respawn every frame.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::config::AdvisorConfig;
use crate::events::{BridgeEvent, EventSink};
use crate::pump::StdioPump;
use crate::queue::{InboundQueue, Origin};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runtime settings for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Command line used by [`ProcessSupervisor::start_configured`]. Split on
    /// whitespace; no shell quoting.
    pub command: String,
    /// How long `start` waits for the advisor's first line.
    pub handshake_timeout: Duration,
    /// How long a terminated advisor gets to exit before it is killed.
    pub grace_period: Duration,
    /// File the advisor's stderr is appended to.
    pub error_log: PathBuf,
    /// Log every line crossing the pump at debug level.
    pub trace_io: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            command: String::new(),
            handshake_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            error_log: PathBuf::from("advisor_errors.log"),
            trace_io: true,
        }
    }
}

impl From<&AdvisorConfig> for SupervisorSettings {
    fn from(config: &AdvisorConfig) -> Self {
        Self {
            command: config.command.clone(),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            grace_period: Duration::from_millis(config.grace_period_millis),
            error_log: PathBuf::from(&config.error_log),
            trace_io: config.trace_io,
        }
    }
}

/// A running advisor: the OS process plus its two pump threads.
struct AdvisorHandle {
    child: Child,
    pump: StdioPump,
    generation: u64,
}

impl AdvisorHandle {
    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "failed to query advisor status; treating as exited");
                true
            }
        }
    }

    /// Interrupt the pump, ask the process to exit, and kill it if it is
    /// still running after `grace`.
    fn terminate(mut self, grace: Duration) {
        self.pump.interrupt();
        if self.has_exited() {
            return;
        }

        request_exit(&mut self.child);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.has_exited() {
                return;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        debug!(pid = self.child.id(), "advisor ignored termination request; killing");
        self.kill();
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "advisor kill failed (already exited?)");
        }
        let _ = self.child.wait();
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: plain signal delivery to a child we still own and have not reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM delivery failed; advisor probably already gone");
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.kill();
}

/// Supervises at most one advisor process at a time.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    inbound: InboundQueue,
    events: EventSink,
    handle: Option<AdvisorHandle>,
    /// Generation of the most recent launch attempt.
    generation: u64,
    /// Generation whose handshake succeeded; lines from any other advisor
    /// generation are stale.
    accepted_generation: Option<u64>,
    snapshot_requested: bool,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings, inbound: InboundQueue, events: EventSink) -> Self {
        Self {
            settings,
            inbound,
            events,
            handle: None,
            generation: 0,
            accepted_generation: None,
            snapshot_requested: false,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Start (or restart) the advisor with the configured command.
    ///
    /// Returns `false` without launching anything when no command is
    /// configured.
    pub fn start_configured(&mut self) -> bool {
        let command = self.settings.command.trim().to_string();
        if command.is_empty() {
            debug!("no advisor command configured; not starting");
            return false;
        }
        self.start(&command)
    }

    /// Start the advisor, tearing down any running one first.
    ///
    /// Blocks until the advisor writes its handshake line or the handshake
    /// timeout expires. Every failure is logged and reported as `false`.
    pub fn start(&mut self, command_line: &str) -> bool {
        self.teardown();
        self.accepted_generation = None;

        let argv: Vec<&str> = command_line.split_whitespace().collect();
        if argv.is_empty() {
            warn!("refusing to start advisor: empty command line");
            return false;
        }

        self.generation += 1;
        let generation = self.generation;
        let origin = Origin::Advisor { generation };

        let mut handle = match self.launch(&argv, generation) {
            Ok(handle) => handle,
            Err(e) => {
                error!(command = %command_line, "could not start advisor process: {e:#}");
                self.events.emit(BridgeEvent::AdvisorSpawnFailed {
                    command: command_line.to_string(),
                    error: format!("{e:#}"),
                });
                return false;
            }
        };

        info!(
            command = %command_line,
            pid = handle.child.id(),
            generation,
            timeout_secs = self.settings.handshake_timeout.as_secs_f64(),
            "waiting for advisor handshake"
        );

        let handshake = self
            .inbound
            .pop_matching_timeout(self.settings.handshake_timeout, |m| m.origin == origin);

        let Some(handshake) = handshake else {
            handle.pump.interrupt();
            handle.kill();
            self.inbound.retain(|m| m.origin != origin);
            error!(
                command = %command_line,
                "timed out waiting for handshake from advisor process"
            );
            error!(
                "check {} for stderr output from the advisor",
                self.settings.error_log.display()
            );
            self.events.emit(BridgeEvent::HandshakeTimedOut {
                command: command_line.to_string(),
                timeout_secs: self.settings.handshake_timeout.as_secs(),
            });
            return false;
        };

        info!(message = %handshake.text, "received handshake from advisor");
        self.events.emit(BridgeEvent::AdvisorStarted {
            command: command_line.to_string(),
            generation,
            handshake: handshake.text,
        });
        self.handle = Some(handle);
        self.accepted_generation = Some(generation);
        self.snapshot_requested = true;
        true
    }

    fn launch(&self, argv: &[&str], generation: u64) -> Result<AdvisorHandle> {
        let error_log = &self.settings.error_log;
        if let Some(parent) = error_log.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create error log directory {}", parent.display())
            })?;
        }
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(error_log)
            .with_context(|| format!("failed to open advisor error log {}", error_log.display()))?;

        let mut child = Command::new(argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .spawn()
            .with_context(|| format!("failed to spawn {}", argv[0]))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("advisor process was spawned without piped stdio");
        };

        let pump = match StdioPump::start(
            stdin,
            stdout,
            Origin::Advisor { generation },
            self.inbound.clone(),
            self.settings.trace_io,
        ) {
            Ok(pump) => pump,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        Ok(AdvisorHandle {
            child,
            pump,
            generation,
        })
    }

    /// Stop the advisor if one is running.
    pub fn stop(&mut self) {
        if self.handle.is_some() {
            info!("shutting down advisor process");
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let generation = handle.generation;
            handle.terminate(self.settings.grace_period);
            self.events.emit(BridgeEvent::AdvisorStopped { generation });
        }
    }

    pub fn is_alive(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => !handle.has_exited(),
            None => false,
        }
    }

    /// Per-frame liveness check. Returns true on the frame a crash is noticed.
    ///
    /// A dead advisor's pump is interrupted and the handle is dropped; the
    /// advisor stays down until something calls `start` again.
    pub fn poll(&mut self) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        if !handle.has_exited() {
            return false;
        }

        let writer_was_running = handle.pump.writer_alive();
        handle.pump.interrupt();
        let generation = handle.generation;
        self.handle = None;

        if writer_was_running {
            info!(generation, "advisor process has died");
        } else {
            info!(generation, "advisor process exited after closing its stdin");
        }
        self.events.emit(BridgeEvent::AdvisorDied { generation });
        true
    }

    /// Queue a line for the advisor. Dropped when no advisor is accepting
    /// input.
    pub fn send(&self, message: &str) -> bool {
        match self.handle.as_ref() {
            Some(handle) => handle.pump.send(message),
            None => false,
        }
    }

    /// Whether a line with this origin belongs to the accepted advisor.
    /// Viewer messages are always accepted.
    pub fn accepts(&self, origin: Origin) -> bool {
        match origin {
            Origin::Advisor { generation } => self.accepted_generation == Some(generation),
            Origin::Viewer(_) => true,
        }
    }

    /// Returns true once after a successful handshake so the frame loop can
    /// push a snapshot without waiting for the next state change.
    pub fn take_snapshot_request(&mut self) -> bool {
        std::mem::take(&mut self.snapshot_requested)
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.child.id())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.teardown();
    }
}
