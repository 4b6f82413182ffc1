//! Small shared helpers.

use std::time::Duration;
use tokio::time::Instant;

/// Roughly 30 years, the horizon tokio itself treats as "never".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after`, saturating at a far-future instant instead of panicking
/// on overflow when a configured duration is huge.
pub fn instant_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Serde adapter that reads and writes a `Duration` as (fractional) seconds,
/// the unit every config file in this crate uses.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Same as [`duration_secs`] for optional values; absent means `None`.
pub mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Schedule {
        #[serde(with = "super::duration_secs")]
        every: Duration,
        #[serde(default, with = "super::option_duration_secs")]
        maybe: Option<Duration>,
    }

    #[test]
    fn test_seconds_round_trip_and_rejects_negative() {
        let p: Schedule = serde_json::from_str(r#"{"every": 0.25}"#).unwrap();
        assert_eq!(p.every, Duration::from_millis(250));
        assert_eq!(p.maybe, None);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(serde_json::from_str::<Schedule>(&json).unwrap(), p);
        assert!(serde_json::from_str::<Schedule>(r#"{"every": -1}"#).is_err());
    }

    #[test]
    fn test_instant_after_saturates() {
        let now = super::Instant::now();
        assert_eq!(
            super::instant_after(now, Duration::from_secs(5)),
            now + Duration::from_secs(5)
        );
        let far = super::instant_after(now, Duration::from_secs_f64(1.0e19));
        assert!(far > now + Duration::from_secs(86_400 * 365));
        assert!(super::instant_after(now, Duration::MAX) > now);
    }
}
