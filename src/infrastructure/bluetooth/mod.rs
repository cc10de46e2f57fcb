//! Bluetooth Module
//!
//! Talks to Renpho body-composition scales over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ScaleService                         │
//! │  (Public API: run / trigger / cancel, pushes ScaleEvent) │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │  Session   │  │ Protocol  │
//! │           │  │            │  │           │
//! │ - scale   │  │ - handshake│  │ - UUIDs   │
//! │   matching│  │ - timeouts │  │ - commands│
//! │           │  │ - teardown │  │ - parsing │
//! └─────┬─────┘  └─────┬──────┘  └───────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────┐
//! │   Transport (BleTransport)  │
//! │   btleplug adapter / mock   │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Frame layouts, command builders and notification parsing
//! - [`transport`] - Adapter traits, link events and cancellation
//! - [`session`] - One measurement from connect to teardown
//! - [`scanner`] - Scale discovery
//! - [`service`] - Main service coordinator

#[cfg(feature = "btleplug")]
pub mod btleplug;
#[cfg(test)]
pub(crate) mod mock;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod transport;

// Re-export main service for convenience
pub use service::ScaleService;
