//! Body composition estimates
//!
//! Bioelectrical impedance formulas from the published literature. The
//! results are approximations: the same inputs always produce the same
//! numbers, but they are not clinical measurements.
//!
//! - Fat-free mass and total body water: Sun et al. (2003)
//! - Skeletal muscle mass: Janssen et al. (2000)
//! - Bone mass: fixed share of fat-free mass

use crate::domain::models::{BodyComposition, ParsedMeasurement, Sex, UserProfile};

/// Sun et al. fat-free mass coefficients: (intercept, H²/R, weight, resistance)
mod ffm {
    pub const MALE: (f64, f64, f64, f64) = (-10.68, 0.65, 0.26, 0.02);
    pub const FEMALE: (f64, f64, f64, f64) = (-9.53, 0.69, 0.17, 0.02);
}

/// Sun et al. total body water coefficients: (intercept, H²/R, weight)
mod tbw {
    pub const MALE: (f64, f64, f64) = (1.2, 0.45, 0.18);
    pub const FEMALE: (f64, f64, f64) = (3.75, 0.45, 0.11);
}

/// Janssen et al. skeletal muscle coefficients
mod smm {
    pub const RESISTANCE_INDEX: f64 = 0.401;
    pub const MALE: f64 = 3.825;
    pub const AGE: f64 = -0.071;
    pub const INTERCEPT: f64 = 5.102;
}

/// Bone mass as a share of fat-free mass
const BONE_FRACTION_OF_FFM: f64 = 0.042;

/// Estimate body composition, or `None` when the inputs do not allow it
/// (no impedance reading, incomplete profile, non-positive weight or height).
pub fn compute_body_composition(
    measurement: &ParsedMeasurement,
    profile: &UserProfile,
) -> Option<BodyComposition> {
    let impedance = measurement.impedance_ohms?;
    let height = profile.height_cm?;
    let age = f64::from(profile.age?);
    let sex = profile.sex?;
    let weight = measurement.weight_kg;

    if weight <= 0.0 || height <= 0.0 || impedance <= 0.0 {
        return None;
    }

    let resistance_index = height * height / impedance;

    let (a, b, c, d) = match sex {
        Sex::Male => ffm::MALE,
        Sex::Female => ffm::FEMALE,
    };
    let fat_free_mass = a + b * resistance_index + c * weight + d * impedance;

    let (a, b, c) = match sex {
        Sex::Male => tbw::MALE,
        Sex::Female => tbw::FEMALE,
    };
    let total_body_water = a + b * resistance_index + c * weight;

    let male = if sex == Sex::Male { 1.0 } else { 0.0 };
    let muscle_mass_kg = smm::RESISTANCE_INDEX * resistance_index
        + smm::MALE * male
        + smm::AGE * age
        + smm::INTERCEPT;

    Some(BodyComposition {
        body_fat_percent: (weight - fat_free_mass) / weight * 100.0,
        body_water_percent: total_body_water / weight * 100.0,
        muscle_mass_kg,
        bone_mass_kg: fat_free_mass * BONE_FRACTION_OF_FFM,
    })
}
