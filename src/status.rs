//! Decoding of raw property values into a typed toilet-lid status.

use crate::error::{MiioError, Result};
use crate::model::Field;
use serde_json::Value;
use std::collections::HashMap;

/// Interprets a raw property value as an integer, nonzero meaning `true`.
///
/// Integers, booleans, floats (truncated) and strings holding an integer are
/// accepted. Anything else is a decode error rather than `false`.
pub fn decode_bool(property: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i != 0)
            } else if let Some(u) = n.as_u64() {
                Ok(u != 0)
            } else {
                n.as_f64().map(|f| f.trunc() != 0.0).ok_or_else(|| {
                    MiioError::Decode(format!("{}: unsupported number {}", property, n))
                })
            }
        }
        Value::String(s) => s.trim().parse::<i128>().map(|i| i != 0).map_err(|_| {
            MiioError::Decode(format!("{}: '{}' is not an integer", property, s))
        }),
        other => Err(MiioError::Decode(format!(
            "{}: unexpected value {}",
            property, other
        ))),
    }
}

/// One poll's worth of device state.
///
/// Holds the raw values keyed by property name and the boolean fields decoded
/// from them. A field is `None` when its property was not requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStatus {
    raw: HashMap<String, Value>,
    seating: Option<bool>,
    light: Option<bool>,
    self_clean: Option<bool>,
    air_filter: Option<bool>,
}

/// Decodes a property-name → raw-value mapping.
pub fn decode(raw: HashMap<String, Value>) -> Result<DeviceStatus> {
    let mut status = DeviceStatus::default();
    for (property, value) in &raw {
        let Some(field) = Field::from_property(property) else {
            continue;
        };
        let decoded = Some(decode_bool(property, value)?);
        match field {
            Field::Seating => status.seating = decoded,
            Field::Light => status.light = decoded,
            Field::SelfClean => status.self_clean = decoded,
            Field::AirFilter => status.air_filter = decoded,
        }
    }
    status.raw = raw;
    Ok(status)
}

impl DeviceStatus {
    /// Pairs requested names with the values returned for them, then decodes.
    pub fn from_values<S: AsRef<str>>(names: &[S], values: Vec<Value>) -> Result<Self> {
        if names.len() != values.len() {
            return Err(MiioError::Protocol(format!(
                "requested {} properties, received {} values",
                names.len(),
                values.len()
            )));
        }
        let raw = names
            .iter()
            .map(|n| n.as_ref().to_string())
            .zip(values)
            .collect();
        decode(raw)
    }

    /// Occupancy; defined as the seating field.
    pub fn is_on(&self) -> Option<bool> {
        self.seating
    }

    pub fn seating(&self) -> Option<bool> {
        self.seating
    }

    pub fn light(&self) -> Option<bool> {
        self.light
    }

    pub fn self_clean(&self) -> Option<bool> {
        self.self_clean
    }

    pub fn air_filter(&self) -> Option<bool> {
        self.air_filter
    }

    pub fn field(&self, field: Field) -> Option<bool> {
        match field {
            Field::Seating => self.seating,
            Field::Light => self.light,
            Field::SelfClean => self.self_clean,
            Field::AirFilter => self.air_filter,
        }
    }

    /// Raw value as returned by the device.
    pub fn raw(&self, property: &str) -> Option<&Value> {
        self.raw.get(property)
    }
}
