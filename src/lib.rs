//! Client for Renpho BLE body-composition scales.
//!
//! [`ScaleSession`] drives one measurement over any [`BleTransport`];
//! [`ScaleService`] adds discovery, per-scale serialization and result
//! events on top. Enable the `btleplug` feature for a desktop adapter.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    BodyComposition, DeviceAddress, Measurement, MeasurementReport, ScaleEvent, Sex, UserProfile,
    WeightUnit,
};
pub use infrastructure::bluetooth::session::{
    FailureKind, ScaleSession, SessionConfig, SessionError, SessionResult, SessionTimeouts,
};
pub use infrastructure::bluetooth::transport::{cancel_pair, BleTransport, CancelToken, ScaleLink};
pub use infrastructure::bluetooth::ScaleService;
