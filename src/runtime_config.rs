//! # Runtime Configuration
//!
//! Environment-driven tuning for the coroutine runtime.
//!
//! ## Environment Variables
//!
//! ### `BRRTCH_STACK_SIZE`
//!
//! Stack size for connection and client coroutines, in decimal (`65536`) or
//! hexadecimal (`0x10000`). Default: `0x10000` (64 KB).
//!
//! Every live connection owns one long-lived coroutine, so total memory is
//! roughly `stack_size × concurrent_connections`; tune down for very high
//! connection counts, up if frames are built from deep call chains.

use std::env;

/// Default coroutine stack size (64 KB).
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Stack size in bytes for spawned coroutines.
    pub stack_size: usize,
}

impl RuntimeConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let stack_size = env::var("BRRTCH_STACK_SIZE")
            .ok()
            .and_then(|v| parse_size(&v))
            .unwrap_or(DEFAULT_STACK_SIZE);
        RuntimeConfig { stack_size }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

fn parse_size(s: &str) -> Option<usize> {
    if let Some(hex) = s.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}
