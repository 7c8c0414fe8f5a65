use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::util::paths::config_path;

/// Example configuration file contents (bundled with the binary)
pub const EXAMPLE_CONFIG: &str = include_str!("config.toml.example");

/// Application configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Presence and locking settings
    pub coordinator: CoordinatorConfig,
    /// Snapshot storage and retention
    pub backup: BackupConfig,
    /// Safety policy knobs
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Explicit agent id (None = derived from host and pid)
    pub agent_id: Option<String>,
    /// How often the heartbeat rewrites this agent's record
    pub heartbeat_interval: Duration,
    /// Maximum heartbeat age before a sibling is considered dead
    pub liveness_threshold: Duration,
    /// Lifetime of the global lock before it may be taken over
    pub lock_timeout: Duration,
    /// Poll interval for `wait_for_compatibility`
    pub compatibility_poll: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            heartbeat_interval: Duration::from_secs(30),
            liveness_threshold: Duration::from_secs(120),
            lock_timeout: Duration::from_secs(300),
            compatibility_poll: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// zstd-compress snapshot payloads
    pub compress: bool,
    /// Age in days after which full and incremental snapshots are removed
    pub retention_days: u32,
    /// Age in days after which safety snapshots are removed
    pub safety_retention_days: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            compress: false,
            retention_days: 30,
            safety_retention_days: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Take a safety snapshot before destructive operations unless told otherwise
    pub auto_backup_before_changes: bool,
    /// Destructive operations must carry an explicit confirmation
    pub require_confirmation_for_destructive: bool,
    /// Operations run as dry runs unless told otherwise
    pub dry_run_by_default: bool,
    /// Ceiling on successful operations between two backups
    pub max_operations_without_backup: u32,
    /// Restore the pre-operation snapshot when a destructive operation fails
    pub emergency_rollback_enabled: bool,
    /// Sibling conflicts abort destructive operations
    pub require_compatibility: bool,
    /// Post-operation verification failures become errors
    pub strict_post_checks: bool,
    /// Elapsed time after which the monitor starts warning
    pub long_running_warning: Duration,
    /// Monitor tick interval
    pub monitor_interval: Duration,
    /// Hard deadline for an operation (None = no deadline)
    pub operation_timeout: Option<Duration>,
    /// Number of entries kept in the operation log
    pub max_log_entries: usize,
    /// Collections captured for snapshots
    pub collections: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            auto_backup_before_changes: true,
            require_confirmation_for_destructive: true,
            dry_run_by_default: false,
            max_operations_without_backup: 10,
            emergency_rollback_enabled: true,
            require_compatibility: true,
            strict_post_checks: false,
            long_running_warning: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(30),
            operation_timeout: None,
            max_log_entries: 100,
            collections: Vec::new(),
        }
    }
}

/// TOML representation of `[coordinator]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlCoordinatorConfig {
    pub agent_id: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub liveness_threshold_secs: Option<u64>,
    pub lock_timeout_secs: Option<u64>,
    pub compatibility_poll_ms: Option<u64>,
}

/// TOML representation of `[backup]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlBackupConfig {
    pub compress: Option<bool>,
    pub retention_days: Option<u32>,
    pub safety_retention_days: Option<u32>,
}

/// TOML representation of `[safety]`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlSafetyConfig {
    pub auto_backup_before_changes: Option<bool>,
    pub require_confirmation_for_destructive: Option<bool>,
    pub dry_run_by_default: Option<bool>,
    pub max_operations_without_backup: Option<u32>,
    pub emergency_rollback_enabled: Option<bool>,
    pub require_compatibility: Option<bool>,
    pub strict_post_checks: Option<bool>,
    pub long_running_warning_secs: Option<u64>,
    pub monitor_interval_secs: Option<u64>,
    pub operation_timeout_secs: Option<u64>,
    pub max_log_entries: Option<usize>,
    pub collections: Option<Vec<String>>,
}

/// TOML representation of the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub coordinator: Option<TomlCoordinatorConfig>,
    pub backup: Option<TomlBackupConfig>,
    pub safety: Option<TomlSafetyConfig>,
}

impl Config {
    /// Load configuration from the default config path, creating an
    /// example file on first run.
    pub fn load() -> Self {
        let config_file = config_path();

        if !config_file.exists() {
            Self::create_default_config(&config_file);
        }

        Self::load_from(&config_file)
    }

    /// Load configuration from a specific file. Missing or malformed files
    /// yield the defaults.
    pub fn load_from(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read config");
                }
                return Self::default();
            }
        };

        match Self::from_toml_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Invalid config, using defaults");
                Self::default()
            }
        }
    }

    /// Parse TOML contents and merge them over the defaults
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let toml_config: TomlConfig = toml::from_str(contents)?;
        let mut config = Config::default();
        config.merge(toml_config);
        Ok(config)
    }

    fn merge(&mut self, toml_config: TomlConfig) {
        if let Some(coordinator) = toml_config.coordinator {
            let c = &mut self.coordinator;
            if coordinator.agent_id.is_some() {
                c.agent_id = coordinator.agent_id;
            }
            if let Some(secs) = coordinator.heartbeat_interval_secs {
                c.heartbeat_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = coordinator.liveness_threshold_secs {
                c.liveness_threshold = Duration::from_secs(secs);
            }
            if let Some(secs) = coordinator.lock_timeout_secs {
                c.lock_timeout = Duration::from_secs(secs);
            }
            if let Some(ms) = coordinator.compatibility_poll_ms {
                c.compatibility_poll = Duration::from_millis(ms);
            }
        }

        if let Some(backup) = toml_config.backup {
            if let Some(compress) = backup.compress {
                self.backup.compress = compress;
            }
            if let Some(days) = backup.retention_days {
                self.backup.retention_days = days;
            }
            if let Some(days) = backup.safety_retention_days {
                self.backup.safety_retention_days = days;
            }
        }

        if let Some(safety) = toml_config.safety {
            let s = &mut self.safety;
            if let Some(v) = safety.auto_backup_before_changes {
                s.auto_backup_before_changes = v;
            }
            if let Some(v) = safety.require_confirmation_for_destructive {
                s.require_confirmation_for_destructive = v;
            }
            if let Some(v) = safety.dry_run_by_default {
                s.dry_run_by_default = v;
            }
            if let Some(v) = safety.max_operations_without_backup {
                s.max_operations_without_backup = v;
            }
            if let Some(v) = safety.emergency_rollback_enabled {
                s.emergency_rollback_enabled = v;
            }
            if let Some(v) = safety.require_compatibility {
                s.require_compatibility = v;
            }
            if let Some(v) = safety.strict_post_checks {
                s.strict_post_checks = v;
            }
            if let Some(secs) = safety.long_running_warning_secs {
                s.long_running_warning = Duration::from_secs(secs);
            }
            if let Some(secs) = safety.monitor_interval_secs {
                s.monitor_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = safety.operation_timeout_secs {
                s.operation_timeout = Some(Duration::from_secs(secs));
            }
            if let Some(n) = safety.max_log_entries {
                s.max_log_entries = n;
            }
            if let Some(collections) = safety.collections {
                s.collections = collections;
            }
        }
    }

    fn create_default_config(path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                tracing::warn!(error = %e, "Failed to create config directory");
                return;
            }
        }

        if let Err(e) = fs::write(path, EXAMPLE_CONFIG) {
            tracing::warn!(error = %e, "Failed to write default config");
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.coordinator.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.safety.collections = collections;
        self
    }
}
