use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".spirebridge";

/// How the advisor subprocess is launched and supervised.
///
/// ```toml
/// [advisor]
/// command = "python3 advisor.py --model fast"
/// run_at_start = true
/// handshake_timeout_secs = 10
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorConfig {
    /// Whitespace-separated command line. Empty means no advisor.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub run_at_start: bool,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_grace_period_millis")]
    pub grace_period_millis: u64,
    #[serde(default = "default_error_log")]
    pub error_log: String,
    #[serde(default = "default_trace_io")]
    pub trace_io: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_broadcast_enabled")]
    pub enabled: bool,
    #[serde(default = "default_broadcast_host")]
    pub host: String,
    #[serde(default = "default_broadcast_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_overlay_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameConfig {
    #[serde(default = "default_frame_rate_hz")]
    pub rate_hz: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    /// JSON-lines session log. Relative paths resolve against the
    /// directory holding `.spirebridge/`.
    #[serde(default)]
    pub path: Option<String>,
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_grace_period_millis() -> u64 {
    2000
}

fn default_error_log() -> String {
    "advisor_errors.log".to_string()
}

fn default_trace_io() -> bool {
    true
}

fn default_broadcast_enabled() -> bool {
    true
}

fn default_broadcast_host() -> String {
    "127.0.0.1".to_string()
}

fn default_broadcast_port() -> u16 {
    crate::broadcast::DEFAULT_PORT
}

fn default_overlay_enabled() -> bool {
    true
}

fn default_frame_rate_hz() -> u32 {
    60
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            run_at_start: false,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            grace_period_millis: default_grace_period_millis(),
            error_log: default_error_log(),
            trace_io: default_trace_io(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: default_broadcast_enabled(),
            host: default_broadcast_host(),
            port: default_broadcast_port(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: default_overlay_enabled(),
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            rate_hz: default_frame_rate_hz(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub advisor: AdvisorConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub frame: FrameConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl BridgeConfig {
    /// Search upward from `start` for a `.spirebridge/config.toml` file and
    /// load it. Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: BridgeConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((BridgeConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Resolve a configured relative path against the project root (the
    /// directory containing `.spirebridge/`), or `cwd` when no config file
    /// was found.
    pub fn resolve_path(config_path: Option<&Path>, cwd: &Path, configured: &str) -> PathBuf {
        let configured = Path::new(configured);
        if configured.is_absolute() {
            return configured.to_path_buf();
        }
        let root = config_path
            .and_then(Path::parent)
            .and_then(Path::parent)
            .unwrap_or(cwd);
        root.join(configured)
    }
}
