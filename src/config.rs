use std::ops::Range;
use std::path::Path;

use thiserror::Error;

/// Invalid run parameters, rejected before anything touches the store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} should be a positive integer")]
    NotPositive(&'static str),
    #[error("{0} should be non-empty")]
    Empty(&'static str),
    #[error("{name} range {begin}..{end} is malformed")]
    BadRange {
        name: &'static str,
        begin: usize,
        end: usize,
    },
    #[error("{0} should be equal to 0 or 1")]
    NotSwitch(&'static str),
}

/// Parses the 0/1 switches the command line uses for booleans.
pub fn parse_switch(name: &'static str, value: u8) -> Result<bool, ConfigError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ConfigError::NotSwitch(name)),
    }
}

pub(crate) fn require_positive(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive(name));
    }
    Ok(())
}

pub(crate) fn require_path(name: &'static str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::Empty(name));
    }
    Ok(())
}

pub(crate) fn require_range(name: &'static str, range: &Range<usize>) -> Result<(), ConfigError> {
    if range.end < range.start {
        return Err(ConfigError::BadRange {
            name,
            begin: range.start,
            end: range.end,
        });
    }
    Ok(())
}
