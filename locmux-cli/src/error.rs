//! Centralized CLI error handling.

use locmux::config::ConfigError;
use locmux::manager::ManagerError;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum CliError {
    Io(io::Error),
    Config(ConfigError),
    Manager(ManagerError),
    Usage(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Config(e) => write!(f, "Configuration error: {}", e),
            Self::Manager(e) => write!(f, "Manager error: {}", e),
            Self::Usage(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Manager(e) => Some(e),
            Self::Usage(_) => None,
        }
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ManagerError> for CliError {
    fn from(e: ManagerError) -> Self {
        Self::Manager(e)
    }
}
