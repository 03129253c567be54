//! # PhoneDeck – Phone Link
//!
//! Transport core for managing content on a mobile phone attached over a
//! serial link:
//!
//! - **Connection** – serial device handle with configurable baud rate, data
//!   bits, parity, stop bits, flow control, and RS-232 control lines
//! - **Exchange** – AT command / reply with a bounded retry budget
//! - **Gate** – the single exclusive-access token serialising all link use
//! - **Operations** – capability query, list download, file upload/download,
//!   SMS, alarms, dial control, signal strength
//! - **Port Scan** – probe candidate devices for an answering phone
//! - **Views** – line-state polling and graceful shutdown of in-flight work

pub mod link;
