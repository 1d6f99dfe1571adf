//! Environment variable utilities
//!
//! Runtime overrides for `SchedulerConfig` / `IoConfig` are read through
//! these helpers.
//!
//! ```ignore
//! use weft_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let stack: usize = env_get("WEFT_STACK_SIZE", 128 * 1024);
//! let poll = env_get_ms("WEFT_IO_MAX_TIMEOUT_MS", 3000);
//! let debug = env_get_bool("WEFT_DEBUG", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
///
/// Unset variables and values that fail to parse both yield `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true; any other
/// value is false. Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a millisecond count from the environment as a `Duration`
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; tests run in parallel.

    #[test]
    fn test_unset_returns_defaults() {
        let key = "__WEFT_TEST_UNSET_4711__";
        assert_eq!(env_get::<usize>(key, 42), 42);
        assert!(env_get_bool(key, true));
        assert!(!env_get_bool(key, false));
        assert!(env_get_opt::<usize>(key).is_none());
        assert_eq!(env_get_ms(key, 250), Duration::from_millis(250));
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__WEFT_TEST_NUM__", " 123 ");
        assert_eq!(env_get::<usize>("__WEFT_TEST_NUM__", 0), 123);
        assert_eq!(env_get_ms("__WEFT_TEST_NUM__", 0), Duration::from_millis(123));
        std::env::remove_var("__WEFT_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        let key = "__WEFT_TEST_BOOL__";
        for truthy in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var(key, truthy);
            assert!(env_get_bool(key, false), "{truthy}");
        }
        for falsy in ["0", "false", "garbage", ""] {
            std::env::set_var(key, falsy);
            assert!(!env_get_bool(key, true), "{falsy}");
        }
        std::env::remove_var(key);
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__WEFT_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__WEFT_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__WEFT_TEST_INVALID__");
    }
}
