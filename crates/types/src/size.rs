use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A count expressed relative to the observed network size.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SizeValue {
    /// A literal count.
    Fixed(u64),
    /// A percentage of the network, rounded up.
    Percent(f64),
    /// The square root of the network, rounded up.
    #[default]
    Auto,
}

impl SizeValue {
    /// Resolve against `network_size`; the result never exceeds the network size.
    pub fn resolve(&self, network_size: u64) -> u64 {
        let value = match self {
            SizeValue::Fixed(value) => *value,
            SizeValue::Percent(pct) => (network_size as f64 * pct / 100.0).ceil() as u64,
            SizeValue::Auto => (network_size as f64).sqrt().ceil() as u64,
        };
        value.min(network_size)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid size value `{0}`: expected a number, a percentage or `auto`")]
pub struct SizeValueError(pub String);

impl FromStr for SizeValue {
    type Err = SizeValueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("auto") {
            return Ok(SizeValue::Auto);
        }
        if let Some(pct) = trimmed.strip_suffix('%') {
            return match pct.trim().parse::<f64>() {
                Ok(pct) if pct.is_finite() && pct >= 0.0 => Ok(SizeValue::Percent(pct)),
                _ => Err(SizeValueError(value.to_string())),
            };
        }
        trimmed
            .parse::<u64>()
            .map(SizeValue::Fixed)
            .map_err(|_| SizeValueError(value.to_string()))
    }
}

impl fmt::Display for SizeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeValue::Fixed(value) => write!(f, "{value}"),
            SizeValue::Percent(pct) => write!(f, "{pct}%"),
            SizeValue::Auto => f.write_str("auto"),
        }
    }
}

impl Serialize for SizeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SizeValue::Fixed(value) => serializer.serialize_u64(*value),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for SizeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(SizeValue::Fixed(value)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_values_pass_through() {
        assert_eq!(SizeValue::Fixed(2).resolve(10), 2);
    }

    #[test]
    fn percentages_round_up() {
        assert_eq!("50%".parse::<SizeValue>().unwrap().resolve(9), 5);
        assert_eq!("66.6%".parse::<SizeValue>().unwrap().resolve(3), 2);
    }

    #[test]
    fn auto_uses_square_root() {
        assert_eq!(SizeValue::Auto.resolve(9), 3);
        assert_eq!(SizeValue::Auto.resolve(10), 4);
        assert_eq!(SizeValue::Auto.resolve(1), 1);
    }

    #[test]
    fn never_exceeds_network_size() {
        assert_eq!(SizeValue::Fixed(20).resolve(10), 10);
        assert_eq!(SizeValue::Percent(250.0).resolve(4), 4);
    }

    #[test]
    fn parses_and_serializes_config_forms() {
        let values: Vec<SizeValue> = serde_json::from_str(r#"[3, "25%", "auto", "7"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                SizeValue::Fixed(3),
                SizeValue::Percent(25.0),
                SizeValue::Auto,
                SizeValue::Fixed(7)
            ]
        );
        assert_eq!(
            serde_json::to_string(&values).unwrap(),
            r#"[3,"25%","auto",7]"#
        );
        assert!("-5%".parse::<SizeValue>().is_err());
        assert!("many".parse::<SizeValue>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn resolved_value_is_bounded(size in 0u64..100_000, fixed in 0u64..200_000, pct in 0.0f64..300.0) {
            for value in [SizeValue::Fixed(fixed), SizeValue::Percent(pct), SizeValue::Auto] {
                proptest::prop_assert!(value.resolve(size) <= size);
            }
        }
    }
}
