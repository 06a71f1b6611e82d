//! Engine configuration.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::host::ToolType;

/// Engine settings with TOML overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Default agent type for new and migrated sessions
    pub default_agent: ToolType,
    /// Maximum number of tabs per session
    pub max_tabs: usize,
    /// Coalescing tick for streamed output
    pub flush_interval: Duration,
    /// How long an interrupt may go unanswered before escalating to kill
    pub interrupt_escalation: Duration,
    /// Debounce window for snapshot persistence
    pub persist_debounce: Duration,
    /// Database location override (None = platform data dir)
    pub database_path: Option<PathBuf>,
    /// Binary path overrides per tool name
    pub binary_overrides: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_agent: ToolType::Claude,
            max_tabs: 16,
            flush_interval: Duration::from_millis(16),
            interrupt_escalation: Duration::from_secs(5),
            persist_debounce: Duration::from_millis(400),
            database_path: None,
            binary_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TomlSettings {
    default_agent: Option<String>,
    max_tabs: Option<usize>,
    flush_interval_ms: Option<u64>,
    interrupt_escalation_ms: Option<u64>,
    persist_debounce_ms: Option<u64>,
    database_path: Option<PathBuf>,
    #[serde(default)]
    binary_overrides: HashMap<String, String>,
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults for
    /// anything missing or unreadable. A broken config file should never
    /// keep the engine from starting.
    pub fn load(path: &Path) -> Self {
        let mut settings = Self::default();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return settings,
        };
        let parsed: TomlSettings = match toml::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse settings; using defaults");
                return settings;
            }
        };

        if let Some(agent) = parsed.default_agent {
            settings.default_agent = ToolType::parse(&agent);
        }
        if let Some(max_tabs) = parsed.max_tabs {
            settings.max_tabs = max_tabs.max(1);
        }
        if let Some(ms) = parsed.flush_interval_ms {
            settings.flush_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = parsed.interrupt_escalation_ms {
            settings.interrupt_escalation = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed.persist_debounce_ms {
            settings.persist_debounce = Duration::from_millis(ms);
        }
        if parsed.database_path.is_some() {
            settings.database_path = parsed.database_path;
        }
        settings.binary_overrides = parsed.binary_overrides;

        settings
    }

    /// Default config file location
    /// (`~/.config/switchyard/config.toml` or platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("switchyard").join("config.toml"))
    }

    pub fn binary_for(&self, tool: ToolType) -> Option<&str> {
        self.binary_overrides.get(tool.as_str()).map(String::as_str)
    }
}
