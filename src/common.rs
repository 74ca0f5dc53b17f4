//! Common functions.
//!

#[cfg(all(not(test), feature = "EnvLog"))]
pub use log::{debug, error, info, warn};

#[cfg(any(test, not(feature = "EnvLog")))]
pub use std::{println as debug, println as error, println as info, println as warn};

#[cfg(feature = "EnvLog")]
use chrono::Local;
#[cfg(feature = "EnvLog")]
use std::io::Write;

/// Initializes the "env_logger" to print also thread-ids.
#[cfg(feature = "EnvLog")]
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{:?}] {}: {}",
                Local::now().format("%H:%M:%S%.3f"),
                std::thread::current().id(),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

#[cfg(not(feature = "EnvLog"))]
pub fn init_logging() {}
