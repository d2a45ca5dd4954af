pub mod parse;
pub mod types;

pub use parse::{load_config, validate_config, ConfigError};
pub use types::{BackupMode, Config, FieldType};
