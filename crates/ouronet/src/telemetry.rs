//! Tracing bootstrap.
//!
//! Nothing in the workspace installs a subscriber on its own; processes call
//! [`init`] once at startup.

use std::str::FromStr;

use anyhow::{anyhow, Context};
use tracing::Level;

/// Install a formatting subscriber at `level` ("error" through "trace").
pub fn init(level: &str) -> anyhow::Result<()> {
    let level = Level::from_str(level).with_context(|| format!("invalid log level {:?}", level))?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("tracing subscriber already installed: {}", e))
}

/// Like [`init`] but for tests: output goes through the test harness and
/// a second call is not an error.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}
