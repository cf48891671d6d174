//! Process startup utilities: logging and shutdown.

mod logging;
mod shutdown;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{describe, run_until, run_until_stopped, wait_for_shutdown_signal};
