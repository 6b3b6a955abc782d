//! Serde helpers for floats that may be non-finite.
//!
//! JSON has no representation for infinities or NaN, yet calibration
//! particles carry infinite distances and schedulers may hold infinite
//! thresholds. Finite values are written as numbers; the rest as the strings
//! `"inf"`, `"-inf"` and `"nan"`.

use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum Repr {
    Number(f64),
    Text(String),
}

fn from_repr<E: de::Error>(repr: Repr) -> Result<f64, E> {
    match repr {
        Repr::Number(value) => Ok(value),
        Repr::Text(text) => match text.as_str() {
            "inf" => Ok(f64::INFINITY),
            "-inf" => Ok(f64::NEG_INFINITY),
            "nan" => Ok(f64::NAN),
            other => Err(E::custom(format!("invalid float literal '{other}'"))),
        },
    }
}

fn serialize_one<S: Serializer>(value: f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(value)
    } else if value.is_nan() {
        serializer.serialize_str("nan")
    } else if value > 0.0 {
        serializer.serialize_str("inf")
    } else {
        serializer.serialize_str("-inf")
    }
}

struct Lenient(f64);

impl serde::Serialize for Lenient {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_one(self.0, serializer)
    }
}

/// `#[serde(with = "abc_core::floats::lenient")]` for a single `f64`.
pub mod lenient {
    use super::*;

    /// Serializes a possibly non-finite float.
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_one(*value, serializer)
    }

    /// Deserializes a possibly non-finite float.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        from_repr(Repr::deserialize(deserializer)?)
    }
}

/// `#[serde(with = "abc_core::floats::lenient_vec")]` for a `Vec<f64>`.
pub mod lenient_vec {
    use super::*;

    /// Serializes a sequence of possibly non-finite floats.
    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&Lenient(*value))?;
        }
        seq.end()
    }

    /// Deserializes a sequence of possibly non-finite floats.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Repr>::deserialize(deserializer)?
            .into_iter()
            .map(from_repr)
            .collect()
    }
}
