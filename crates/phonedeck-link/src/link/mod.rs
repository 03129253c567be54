//! Phone link: sub-modules.

pub mod types;
pub mod error;
pub mod config;
pub mod commands;
pub mod elements;
pub mod messages;
pub mod alarms;
pub mod connection;
pub mod simulated;
pub mod exchange;
pub mod signal;
pub mod gate;
pub mod transfer;
pub mod scanner;
pub mod service;
pub mod monitor;
pub mod view;

// Re-export top-level items for convenience.
pub use types::*;
pub use error::{LinkError, LinkErrorKind, LinkResult};
pub use config::LinkConfig;
pub use commands::{Category, CommandTable};
pub use elements::PhoneElement;
pub use messages::PhoneMessage;
pub use alarms::PhoneAlarm;
pub use connection::{ConnectionFactory, PhoneConnection, SerialPortFactory};
pub use exchange::{Reply, RetryPolicy, MAX_TRIALS};
pub use signal::SignalQuality;
pub use gate::{Gate, GateGuard};
pub use service::{
    CallKind, Completion, DialMode, OperationHandle, TransportCore, VolumeDirection,
};
pub use monitor::LineMonitor;
pub use view::PhoneView;
