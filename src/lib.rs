//! PhoneDeck application shell.
//!
//! Wires the phone link into application state: logging setup, the live
//! connection settings edited by the UI, and the last port scan.

pub mod phone;

pub use phonedeck_link::link;
pub use phone::{PhoneDeck, PhoneDeckState};

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// level; `log` records from the link crate are bridged in.
pub fn init_logging() -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    #[cfg(feature = "logs-json")]
    let result = builder.json().try_init();
    #[cfg(not(feature = "logs-json"))]
    let result = builder.try_init();

    result.map_err(|e| format!("Failed to initialise logging: {}", e))?;
    tracing::info!("PhoneDeck {} starting", env!("CARGO_PKG_VERSION"));
    Ok(())
}
