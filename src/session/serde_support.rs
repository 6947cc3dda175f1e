//! Wire-format helpers used by the session JSON representation (spec.md §6):
//! durations as nanosecond integers, raw bytes as base64 strings.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod duration_nanos {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

pub mod duration_nanos_opt {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_nanos() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let nanos = Option::<u64>::deserialize(d)?;
        Ok(nanos.map(Duration::from_nanos))
    }
}

pub mod percentiles_nanos {
    use super::*;

    pub fn serialize<S: Serializer>(
        map: &HashMap<u8, Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let as_strings: HashMap<String, u64> = map
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_nanos() as u64))
            .collect();
        as_strings.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<u8, Duration>, D::Error> {
        let as_strings: HashMap<String, u64> = HashMap::deserialize(d)?;
        Ok(as_strings
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u8>().ok().map(|k| (k, Duration::from_nanos(v))))
            .collect())
    }
}

pub mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "duration_nanos")]
        d: Duration,
        #[serde(with = "base64_bytes")]
        b: Vec<u8>,
    }

    #[test]
    fn duration_and_bytes_round_trip_through_wire_format() {
        let w = Wrapper {
            d: Duration::from_millis(42),
            b: vec![1, 2, 3, 255],
        };
        let json = serde_json::to_string(&w).unwrap();
        assert!(json.contains("42000000"));
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }
}
