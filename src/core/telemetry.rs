use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::core::errors::{LoanError, Result};

/// Install a global fmt subscriber at the given level
pub fn init_tracing(level: Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| LoanError::internal(format!("failed to install tracing subscriber: {}", e)))
}

/// Same as `init_tracing` but silent when a subscriber is already installed.
/// Test binaries call this from several tests.
pub fn try_init_tracing(level: Level) {
    let _ = init_tracing(level);
}
