//! Environment variable helpers
//!
//! Runtime knobs are read from `FIBRA_*` variables on top of compile-time
//! defaults. A variable that is unset or fails to parse leaves the default.
//!
//! ```ignore
//! use fibra_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("FIBRA_WORKERS_PER_GROUP", 4);
//! let reactor = env_get_bool("FIBRA_ENABLE_REACTOR", true);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if set and valid.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" are true; "0", "false", "no",
/// "off" are false (case-insensitive). Anything else keeps `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Millisecond duration knob.
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_unset_uses_default() {
        let val: usize = env_get("__FIBRA_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u32>("__FIBRA_TEST_UNSET__").is_none());
        assert!(env_get_bool("__FIBRA_TEST_UNSET__", true));
    }

    #[test]
    fn test_env_get_parses_and_trims() {
        std::env::set_var("__FIBRA_TEST_NUM__", " 123 ");
        assert_eq!(env_get::<usize>("__FIBRA_TEST_NUM__", 0), 123);
        std::env::set_var("__FIBRA_TEST_NUM__", "not-a-number");
        assert_eq!(env_get::<usize>("__FIBRA_TEST_NUM__", 9), 9);
        std::env::remove_var("__FIBRA_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_garbage_keeps_default() {
        std::env::set_var("__FIBRA_TEST_BOOL__", "Off");
        assert!(!env_get_bool("__FIBRA_TEST_BOOL__", true));
        std::env::set_var("__FIBRA_TEST_BOOL__", "YES");
        assert!(env_get_bool("__FIBRA_TEST_BOOL__", false));
        std::env::set_var("__FIBRA_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__FIBRA_TEST_BOOL__", true));
        assert!(!env_get_bool("__FIBRA_TEST_BOOL__", false));
        std::env::remove_var("__FIBRA_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__FIBRA_TEST_MS__", "250");
        assert_eq!(env_get_millis("__FIBRA_TEST_MS__", 1), Duration::from_millis(250));
        std::env::remove_var("__FIBRA_TEST_MS__");
        assert_eq!(env_get_millis("__FIBRA_TEST_MS__", 7), Duration::from_millis(7));
    }
}
