//! Bridge session log: JSON lines, one per lifecycle event.
//!
//! The host drains [`BridgeEvent`]s from the bridge's event channel and
//! appends them here. Each line is a self-contained JSON object with an
//! RFC 3339 timestamp, so a session can be grepped or replayed after the
//! fact without parsing human log output.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::events::BridgeEvent;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    SessionStarted {
        version: String,
        advisor: Option<String>,
        broadcast_port: Option<u16>,
    },
    AdvisorStarted {
        command: String,
        generation: u64,
        handshake: String,
    },
    AdvisorSpawnFailed {
        command: String,
        error: String,
    },
    HandshakeTimedOut {
        command: String,
        timeout_secs: u64,
    },
    AdvisorDied {
        generation: u64,
    },
    AdvisorStopped {
        generation: u64,
    },
    ServerStarted {
        addr: String,
    },
    ServerStopped,
    ViewerConnected {
        viewer: u64,
        peer: String,
    },
    ViewerDropped {
        viewer: u64,
        reason: String,
    },
    RecommendationsUpdated {
        version: u64,
        scores: usize,
    },
    RecommendationsCleared,
    CommandRejected {
        command: String,
        error: String,
    },
    SessionEnded {
        frames: u64,
    },
}

/// Append-only JSON-lines writer.
pub struct SessionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl SessionLog {
    /// Open (or create) the log at `path`, creating parent directories.
    /// Existing content is kept; new entries are appended.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "session log");

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<&BridgeEvent> for LogEvent {
    fn from(event: &BridgeEvent) -> Self {
        match event {
            BridgeEvent::AdvisorStarted {
                command,
                generation,
                handshake,
            } => LogEvent::AdvisorStarted {
                command: command.clone(),
                generation: *generation,
                handshake: handshake.clone(),
            },
            BridgeEvent::AdvisorSpawnFailed { command, error } => LogEvent::AdvisorSpawnFailed {
                command: command.clone(),
                error: error.clone(),
            },
            BridgeEvent::HandshakeTimedOut {
                command,
                timeout_secs,
            } => LogEvent::HandshakeTimedOut {
                command: command.clone(),
                timeout_secs: *timeout_secs,
            },
            BridgeEvent::AdvisorDied { generation } => LogEvent::AdvisorDied {
                generation: *generation,
            },
            BridgeEvent::AdvisorStopped { generation } => LogEvent::AdvisorStopped {
                generation: *generation,
            },
            BridgeEvent::ServerStarted { addr } => LogEvent::ServerStarted { addr: addr.clone() },
            BridgeEvent::ServerStopped => LogEvent::ServerStopped,
            BridgeEvent::ViewerConnected { id, peer } => LogEvent::ViewerConnected {
                viewer: id.0,
                peer: peer.clone(),
            },
            BridgeEvent::ViewerDropped { id, reason } => LogEvent::ViewerDropped {
                viewer: id.0,
                reason: reason.clone(),
            },
            BridgeEvent::RecommendationsUpdated { version, scores } => {
                LogEvent::RecommendationsUpdated {
                    version: *version,
                    scores: *scores,
                }
            }
            BridgeEvent::RecommendationsCleared => LogEvent::RecommendationsCleared,
            BridgeEvent::CommandRejected { command, error } => LogEvent::CommandRejected {
                command: command.clone(),
                error: error.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ConnectionId;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            event: LogEvent::AdvisorStarted {
                command: "advisor --stdio".to_string(),
                generation: 2,
                handshake: "ready".to_string(),
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"advisor_started\""));
        assert!(json.contains("\"generation\":2"));
        assert!(json.contains("\"timestamp\":\"2026-01-01T00:00:00+00:00\""));
    }

    #[test]
    fn unit_variants_serialize_without_data() {
        let json = serde_json::to_string(&LogEntry {
            timestamp: "0".to_string(),
            event: LogEvent::ServerStopped,
        })
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["event"], "server_stopped");
        assert!(parsed.get("data").is_none());
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("session.jsonl");

        let log = SessionLog::new(&log_path).unwrap();
        log.log(LogEvent::SessionStarted {
            version: "0.3.0".to_string(),
            advisor: Some("advisor".to_string()),
            broadcast_port: Some(7778),
        })
        .unwrap();
        log.log(LogEvent::ViewerConnected {
            viewer: 1,
            peer: "127.0.0.1:50000".to_string(),
        })
        .unwrap();
        log.log(LogEvent::SessionEnded { frames: 120 }).unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("event").is_some());
            let timestamp = parsed["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        }

        assert!(lines[0].contains("\"event\":\"session_started\""));
        assert!(lines[1].contains("\"event\":\"viewer_connected\""));
        assert!(lines[2].contains("\"event\":\"session_ended\""));
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("nested").join("run.jsonl");

        let log = SessionLog::new(&log_path).unwrap();
        log.log(LogEvent::RecommendationsCleared).unwrap();

        assert!(log_path.exists());
        assert_eq!(log.path(), log_path);
    }

    #[test]
    fn appends_to_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("append.jsonl");

        {
            let log = SessionLog::new(&log_path).unwrap();
            log.log(LogEvent::ServerStopped).unwrap();
        }
        {
            let log = SessionLog::new(&log_path).unwrap();
            log.log(LogEvent::SessionEnded { frames: 0 }).unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn bridge_event_conversion() {
        let cases = vec![
            (
                BridgeEvent::ViewerDropped {
                    id: ConnectionId(4),
                    reason: "write failed".to_string(),
                },
                LogEvent::ViewerDropped {
                    viewer: 4,
                    reason: "write failed".to_string(),
                },
            ),
            (
                BridgeEvent::HandshakeTimedOut {
                    command: "advisor".to_string(),
                    timeout_secs: 10,
                },
                LogEvent::HandshakeTimedOut {
                    command: "advisor".to_string(),
                    timeout_secs: 10,
                },
            ),
            (
                BridgeEvent::AdvisorDied { generation: 3 },
                LogEvent::AdvisorDied { generation: 3 },
            ),
            (
                BridgeEvent::CommandRejected {
                    command: "play 9".to_string(),
                    error: "no card at index 9".to_string(),
                },
                LogEvent::CommandRejected {
                    command: "play 9".to_string(),
                    error: "no card at index 9".to_string(),
                },
            ),
        ];

        for (event, expected) in &cases {
            assert_eq!(LogEvent::from(event), *expected);
        }
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let ts = now_rfc3339();
        assert!(
            chrono::DateTime::parse_from_rfc3339(&ts).is_ok(),
            "timestamp should be RFC 3339: {ts}"
        );
    }
}
