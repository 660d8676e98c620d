//! AetherOS Kernel Configuration
//! Process-table limits and priority band for the phase-1 kernel

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Kernel configuration parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of process table slots
    pub max_proc: usize,
    /// Size of the name buffer, terminator included
    pub max_name: usize,
    /// Size of the start argument buffer, terminator included
    pub max_arg: usize,
    /// Highest ordinary priority (numerically smallest)
    pub max_priority: u8,
    /// Lowest ordinary priority
    pub min_priority: u8,
    /// Minimum stack size accepted by fork
    pub min_stack: usize,
    /// Priority given to the start1 process
    pub start_priority: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelConfig {
    /// Create a new kernel configuration with default values
    pub const fn new() -> Self {
        Self {
            max_proc: 50,
            max_name: 50,
            max_arg: 100,
            max_priority: 1,
            min_priority: 5,
            min_stack: 80 * 1024,
            start_priority: 1,
        }
    }

    /// Configure a smaller process table, keeping every other limit
    pub fn with_max_proc(mut self, max_proc: usize) -> Self {
        self.max_proc = max_proc;
        self
    }

    /// Priority level reserved for the sentinel
    pub fn sentinel_priority(&self) -> u8 {
        self.min_priority + 1
    }

    /// Stack handed to start1
    pub fn start_stack(&self) -> usize {
        2 * self.min_stack
    }

    /// Number of ready queues, sentinel level included
    pub fn priority_levels(&self) -> usize {
        self.sentinel_priority() as usize
    }

    /// True for priorities an ordinary process may request
    pub fn is_ordinary_priority(&self, priority: u8) -> bool {
        (self.max_priority..=self.min_priority).contains(&priority)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    /// Check the limits are usable
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_proc < 2 {
            return Err(Error::Invalid("max_proc must leave room for sentinel and start1"));
        }
        if self.max_priority == 0 {
            return Err(Error::Invalid("max_priority must be at least 1"));
        }
        if self.max_priority > self.min_priority {
            return Err(Error::Invalid("max_priority must not be below min_priority"));
        }
        if self.min_priority == u8::MAX {
            return Err(Error::Invalid("min_priority leaves no sentinel level"));
        }
        if !self.is_ordinary_priority(self.start_priority) {
            return Err(Error::Invalid("start_priority is outside the ordinary band"));
        }
        if self.max_name < 2 || self.max_arg < 2 {
            return Err(Error::Invalid("name and argument buffers need at least 2 bytes"));
        }
        if self.min_stack == 0 {
            return Err(Error::Invalid("min_stack must be non-zero"));
        }
        Ok(())
    }
}

/// Error types for configuration loading
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("config read error: {0}")]
    Io(String),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}
