//! Scheduler configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder methods
//! 2. Environment variables (runtime)
//! 3. User's config file named by `WEFT_CONFIG_RS` (compile-time)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_runtime::config::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_env()
//!     .stack_size(256 * 1024)
//!     .park_timeout(Duration::from_millis(20));
//! ```

pub mod defaults;

use std::sync::OnceLock;
use std::time::Duration;
use weft_core::constants::MAX_STACK_SIZE;
use weft_core::env::{env_get, env_get_bool, env_get_ms};
use weft_core::{SchedError, SchedResult};

/// Scheduler configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Usable stack bytes per fiber (rounded up to pages at allocation)
    pub stack_size: usize,
    /// Longest a worker parks in the default idle hook before rechecking
    pub park_timeout: Duration,
    /// Trace every run-loop decision at debug level
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `WEFT_STACK_SIZE` - fiber stack size in bytes
    /// - `WEFT_PARK_TIMEOUT_MS` - idle park timeout in milliseconds
    /// - `WEFT_DEBUG` - enable run-loop debug logging (0/1)
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", defaults::STACK_SIZE),
            park_timeout: env_get_ms("WEFT_PARK_TIMEOUT_MS", defaults::PARK_TIMEOUT_MS),
            debug_logging: env_get_bool("WEFT_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Compile-time defaults only, no env override.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> SchedResult<()> {
        if self.stack_size == 0 {
            return Err(SchedError::InvalidConfig("stack_size must be > 0"));
        }
        if self.stack_size > MAX_STACK_SIZE {
            return Err(SchedError::InvalidConfig("stack_size must be <= 1GiB"));
        }
        Ok(())
    }
}

impl std::fmt::Display for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stack_size={} park_timeout={:?} debug_logging={}",
            self.stack_size, self.park_timeout, self.debug_logging
        )
    }
}

/// Stack size used when a fiber is created with size 0
///
/// Resolved once per process from the environment / build defaults.
/// Invalid values fall back to the library default.
pub fn default_stack_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        let config = SchedulerConfig::from_env();
        match config.validate() {
            Ok(()) => config.stack_size,
            Err(e) => {
                weft_core::kwarn!("{}; using {} byte stacks", e, defaults::STACK_SIZE);
                defaults::STACK_SIZE
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_uses_build_defaults() {
        let config = SchedulerConfig::new();
        assert_eq!(config.stack_size, defaults::STACK_SIZE);
        assert_eq!(config.park_timeout, Duration::from_millis(defaults::PARK_TIMEOUT_MS));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .stack_size(256 * 1024)
            .park_timeout(Duration::from_millis(5))
            .debug_logging(true);

        assert_eq!(config.stack_size, 256 * 1024);
        assert_eq!(config.park_timeout, Duration::from_millis(5));
        assert!(config.debug_logging);
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            SchedulerConfig::new().stack_size(0).validate(),
            Err(SchedError::InvalidConfig("stack_size must be > 0"))
        );
        assert!(SchedulerConfig::new().stack_size(MAX_STACK_SIZE + 1).validate().is_err());
        assert!(SchedulerConfig::new().stack_size(MAX_STACK_SIZE).validate().is_ok());
    }

    #[test]
    fn test_default_stack_size_is_valid() {
        let size = default_stack_size();
        assert!(size > 0 && size <= MAX_STACK_SIZE);
    }
}
