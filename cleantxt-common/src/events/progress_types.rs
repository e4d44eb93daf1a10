//! Progress event payload

use serde::{Deserialize, Serialize};

/// Clamp a percent value into [0, 100]; NaN and infinities map to the nearest bound (NaN → 0)
pub fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Fine-grained progress for the running stage
///
/// Only `percent` is mandatory. The textual fields carry the emitter's own
/// formatting (e.g. `"3.2MB/s"`, `"00:34"`) rather than re-parsed numbers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressData {
    /// Percent complete, always within [0, 100]
    #[serde(rename = "progress")]
    pub percent: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_elapsed: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_per_second: Option<String>,

    /// Free-text description supplied by the emitter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Pipeline stage that produced the progress ("acquire", "transcribe")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ProgressData {
    /// Progress with only a percent value (clamped)
    pub fn new(percent: f64) -> Self {
        Self {
            percent: clamp_percent(percent),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_percent_bounds() {
        assert_eq!(clamp_percent(150.0), 100.0);
        assert_eq!(clamp_percent(-3.0), 0.0);
        assert_eq!(clamp_percent(f64::NAN), 0.0);
        assert_eq!(clamp_percent(f64::INFINITY), 100.0);
        assert_eq!(clamp_percent(42.5), 42.5);
    }

    #[test]
    fn test_new_clamps() {
        assert_eq!(ProgressData::new(101.0).percent, 100.0);
    }

    #[test]
    fn test_camel_case_field_names() {
        let data = ProgressData {
            current_step: Some("370".to_string()),
            total_steps: Some("1000".to_string()),
            time_elapsed: Some("00:20".to_string()),
            steps_per_second: Some("18.50 chunks/sec".to_string()),
            ..ProgressData::new(37.0)
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["currentStep"], "370");
        assert_eq!(value["totalSteps"], "1000");
        assert_eq!(value["timeElapsed"], "00:20");
        assert_eq!(value["stepsPerSecond"], "18.50 chunks/sec");
        assert_eq!(value["progress"], 37.0);
    }
}
