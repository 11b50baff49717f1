//! US EPA PM2.5 to AQI conversion and the advice strings shown to users.

use serde::Serialize;

pub const HAZARD_ADVICE: &str =
    "HIGH RISK: Hazardous air predicted within 24h. Use N95 masks and limit outdoor activities.";
pub const SAFE_ADVICE: &str =
    "LOW RISK: Air quality is expected to remain within acceptable limits.";

pub const SEVERE_AQI: u32 = 150;

// (pm_lo, pm_hi, aqi_lo, aqi_hi)
const BREAKPOINTS: [(f64, f64, f64, f64); 5] = [
    (12.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 150.4, 151.0, 200.0),
    (150.5, 250.4, 201.0, 300.0),
    (250.5, 500.4, 301.0, 500.0),
];

/// Piecewise-linear AQI, truncated toward zero. Negative readings map to 0;
/// readings above the top breakpoint keep extrapolating the last segment.
pub fn pm25_to_aqi(pm25: f64) -> u32 {
    if !pm25.is_finite() || pm25 < 0.0 {
        return 0;
    }
    if pm25 <= 12.0 {
        return (50.0 / 12.0 * pm25) as u32;
    }

    let (pm_lo, pm_hi, aqi_lo, aqi_hi) = BREAKPOINTS
        .iter()
        .copied()
        .find(|(_, hi, _, _)| pm25 <= *hi)
        .unwrap_or(BREAKPOINTS[BREAKPOINTS.len() - 1]);

    let slope = (aqi_hi - aqi_lo) / (pm_hi - pm_lo);
    (slope * (pm25 - pm_lo) + aqi_lo) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AqiCategory {
    Good,
    Moderate,
    UnhealthyForSensitive,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    pub fn from_aqi(aqi: u32) -> Self {
        match aqi {
            0..=50 => Self::Good,
            51..=100 => Self::Moderate,
            101..=150 => Self::UnhealthyForSensitive,
            151..=200 => Self::Unhealthy,
            201..=300 => Self::VeryUnhealthy,
            _ => Self::Hazardous,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Moderate => "Moderate",
            Self::UnhealthyForSensitive => "Unhealthy for Sensitive",
            Self::Unhealthy => "Unhealthy",
            Self::VeryUnhealthy => "Very Unhealthy",
            Self::Hazardous => "Hazardous",
        }
    }
}

pub fn health_advice(is_hazardous: bool) -> &'static str {
    if is_hazardous {
        HAZARD_ADVICE
    } else {
        SAFE_ADVICE
    }
}

pub fn health_recommendations(is_hazardous: bool, current_aqi: u32) -> Vec<String> {
    let mut out = vec![health_advice(is_hazardous).to_string()];
    if current_aqi > SEVERE_AQI {
        out.push("Limit all outdoor physical activity.".to_string());
        out.push("Keep all windows closed to prevent smog entry.".to_string());
    }
    out
}
