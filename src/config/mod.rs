mod settings;

pub use settings::{BackupConfig, Config, CoordinatorConfig, SafetyConfig, EXAMPLE_CONFIG};
