//! Utility modules

pub mod fs;
pub mod paths;

pub use paths::{
    backups_dir, config_path, data_dir, init_data_dir, log_file_path, logs_dir,
    operation_log_path, rollbacks_dir, shared_dir,
};
