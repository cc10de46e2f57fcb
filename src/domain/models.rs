use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pounds per kilogram
pub const LB_PER_KG: f64 = 2.204_622_621_8;

/// Unit the caller wants weights reported in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[default]
    Kg,
    Lb,
}

impl WeightUnit {
    /// Unit selector byte sent in the weight request
    pub fn protocol_byte(self) -> u8 {
        match self {
            Self::Kg => 0x01,
            Self::Lb => 0x02,
        }
    }

    /// Convert a mass from the internal kilogram representation
    pub fn from_kg(self, kg: f64) -> f64 {
        match self {
            Self::Kg => kg,
            Self::Lb => kg * LB_PER_KG,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Kg => "kg",
            Self::Lb => "lb",
        }
    }
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

/// Body profile used for the derived metrics. Every field is optional;
/// metrics are only computed when all of them are present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub height_cm: Option<f64>,
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub sex: Option<Sex>,
}

/// BLE address or platform peripheral id of a scale
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Weight notification decoded from the scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedMeasurement {
    /// Weight in kilograms
    pub weight_kg: f64,
    /// Weight field as sent by the scale, before scaling
    pub raw_weight: u16,
    /// Primary resistance reading, `None` when the scale reported no contact
    pub resistance: Option<u16>,
    /// Secondary resistance reading, `None` when the scale reported no contact
    pub secondary_resistance: Option<u16>,
    /// Impedance in ohms derived from the primary resistance
    pub impedance_ohms: Option<f64>,
    /// Settled reading (as opposed to a transient display value)
    pub stable: bool,
    /// Protocol variant byte echoed by the scale
    pub protocol_type: u8,
}

/// Estimated body composition. Masses are in kilograms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyComposition {
    pub body_fat_percent: f64,
    pub body_water_percent: f64,
    pub muscle_mass_kg: f64,
    pub bone_mass_kg: f64,
}

/// Result bundle of a completed session
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub reading: ParsedMeasurement,
    pub body_composition: Option<BodyComposition>,
    /// Frames dropped during the session because they failed validation
    pub malformed_frames: u32,
    pub completed_at: DateTime<Utc>,
}

/// Caller-facing view of a measurement in the preferred unit.
///
/// This is the only place where masses leave the kilogram representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementReport {
    pub unit: WeightUnit,
    pub weight: f64,
    pub impedance_ohms: Option<f64>,
    pub body_fat_percent: Option<f64>,
    pub body_water_percent: Option<f64>,
    pub muscle_mass: Option<f64>,
    pub bone_mass: Option<f64>,
    pub malformed_frames: u32,
    pub timestamp: DateTime<Utc>,
}

impl MeasurementReport {
    pub fn new(measurement: &Measurement, unit: WeightUnit) -> Self {
        let composition = measurement.body_composition.as_ref();
        Self {
            unit,
            weight: unit.from_kg(measurement.reading.weight_kg),
            impedance_ohms: measurement.reading.impedance_ohms,
            body_fat_percent: composition.map(|c| c.body_fat_percent),
            body_water_percent: composition.map(|c| c.body_water_percent),
            muscle_mass: composition.map(|c| unit.from_kg(c.muscle_mass_kg)),
            bone_mass: composition.map(|c| unit.from_kg(c.bone_mass_kg)),
            malformed_frames: measurement.malformed_frames,
            timestamp: measurement.completed_at,
        }
    }

    /// Flattened sensor readings, skipping metrics that were not computed
    pub fn readings(&self) -> Vec<SensorReading> {
        let mass_unit = self.unit.symbol();
        let mut readings = vec![SensorReading {
            key: "weight",
            value: self.weight,
            unit: mass_unit,
        }];

        let optional = [
            ("body_fat", self.body_fat_percent, "%"),
            ("body_water", self.body_water_percent, "%"),
            ("muscle_mass", self.muscle_mass, mass_unit),
            ("bone_mass", self.bone_mass, mass_unit),
            ("impedance", self.impedance_ohms, "Ω"),
        ];
        readings.extend(optional.into_iter().filter_map(|(key, value, unit)| {
            value.map(|value| SensorReading { key, value, unit })
        }));

        readings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    pub key: &'static str,
    pub value: f64,
    pub unit: &'static str,
}

/// Events pushed to observers of the scale service
#[derive(Debug, Clone)]
pub enum ScaleEvent {
    SessionStarted(DeviceAddress),
    Measurement {
        address: DeviceAddress,
        report: MeasurementReport,
    },
    Failed {
        address: Option<DeviceAddress>,
        kind: crate::infrastructure::bluetooth::session::FailureKind,
        message: String,
    },
}
