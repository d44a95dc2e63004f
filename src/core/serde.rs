use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Serializes Duration as fractional milliseconds
pub fn serialize_duration_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    (duration.as_secs_f64() * 1000.0).serialize(serializer)
}

/// Deserializes Duration from milliseconds
pub fn deserialize_duration_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = f64::deserialize(deserializer)?;
    if !ms.is_finite() || ms < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "duration must be a non-negative number of milliseconds, got {}",
            ms
        )));
    }
    Duration::try_from_secs_f64(ms / 1000.0).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Test {
        #[serde(serialize_with = "serialize_duration_ms")]
        #[serde(deserialize_with = "deserialize_duration_ms")]
        interval: Duration,
    }

    #[test]
    fn test_duration_serialization() {
        let original = Test {
            interval: Duration::from_millis(1500),
        };

        let serialized = serde_json::to_string(&original).unwrap();
        assert_eq!(serialized, r#"{"interval":1500.0}"#);

        let deserialized: Test = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.interval, original.interval);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let result = serde_json::from_str::<Test>(r#"{"interval":-5}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_oversized_duration_rejected() {
        let result = serde_json::from_str::<Test>(r#"{"interval":1e300}"#);
        assert!(result.is_err());
    }
}
