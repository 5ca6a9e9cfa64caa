//! Supported toilet-lid models and their per-model tables: property
//! allow-list, exposed attribute names and command names.

use log::warn;
use serde_json::{Value, json};
use std::str::FromStr;

define_models! {
    /// Whale smart toilet cover Pro, with air filter
    XjxToiletPro = "xjx.toilet.pro",
    /// Whale smart toilet cover without the air filter. The identifier is
    /// assumed from the vendor naming scheme; no captured `miIO.info` confirms it.
    XjxToiletPure = "xjx.toilet.pure",
}

pub const DEFAULT_MODEL: Model = Model::XjxToiletPro;

pub const PROP_SEATING: &str = "seating";
pub const PROP_AIR_FILTER: &str = "status_airfilter";
pub const PROP_LED: &str = "status_led";
pub const PROP_SELF_CLEAN: &str = "status_selfclean";

// Other properties answered by the firmware are left out of the allow-lists:
// fan_temp, massage, moving and the water_* family time out on real devices;
// left_day, seat_temp, status_tunwash, status_warmdry, status_womenwash and
// fw_ver answer but are not decoded.
const PRO_PROPERTIES: &[&str] = &[PROP_SEATING, PROP_AIR_FILTER, PROP_LED, PROP_SELF_CLEAN];
const PURE_PROPERTIES: &[&str] = &[PROP_SEATING, PROP_LED, PROP_SELF_CLEAN];

/// Boolean fields decoded from the raw property values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Seating,
    Light,
    SelfClean,
    AirFilter,
}

impl Field {
    pub const ALL: &'static [Field] = &[
        Field::Seating,
        Field::Light,
        Field::SelfClean,
        Field::AirFilter,
    ];

    /// The vendor property backing this field.
    pub fn property(&self) -> &'static str {
        match self {
            Field::Seating => PROP_SEATING,
            Field::Light => PROP_LED,
            Field::SelfClean => PROP_SELF_CLEAN,
            Field::AirFilter => PROP_AIR_FILTER,
        }
    }

    pub fn from_property(name: &str) -> Option<Field> {
        Field::ALL.iter().copied().find(|f| f.property() == name)
    }
}

const PRO_ATTRIBUTES: &[(&str, Field)] = &[
    ("seating", Field::Seating),
    ("air_filter", Field::AirFilter),
    ("led", Field::Light),
    ("self_clean", Field::SelfClean),
];
const PURE_ATTRIBUTES: &[(&str, Field)] = &[
    ("seating", Field::Seating),
    ("light", Field::Light),
    ("self_clean", Field::SelfClean),
];

/// Vendor method names used by the named operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    pub self_clean_on: &'static str,
    pub light_on: &'static str,
    pub func_off: &'static str,
    pub self_clean_func: &'static str,
    pub light_func: &'static str,
}

const WHALE_COMMANDS: CommandTable = CommandTable {
    self_clean_on: "self_clean_on",
    light_on: "night_led_on",
    func_off: "func_off",
    self_clean_func: "self_clean",
    light_func: "night_led",
};

impl CommandTable {
    /// Method and parameters that switch self-clean on or off.
    pub fn self_clean(&self, on: bool) -> (&'static str, Value) {
        if on {
            (self.self_clean_on, json!([]))
        } else {
            (self.func_off, json!([self.self_clean_func]))
        }
    }

    /// Method and parameters that switch the night light on or off.
    pub fn light(&self, on: bool) -> (&'static str, Value) {
        if on {
            (self.light_on, json!([]))
        } else {
            (self.func_off, json!([self.light_func]))
        }
    }
}

impl Model {
    /// Properties requested on every refresh unless overridden by configuration.
    pub fn properties(&self) -> &'static [&'static str] {
        match self {
            Model::XjxToiletPro => PRO_PROPERTIES,
            Model::XjxToiletPure => PURE_PROPERTIES,
        }
    }

    /// Entity attribute names exposed to the host, and the field behind each.
    pub fn attributes(&self) -> &'static [(&'static str, Field)] {
        match self {
            Model::XjxToiletPro => PRO_ATTRIBUTES,
            Model::XjxToiletPure => PURE_ATTRIBUTES,
        }
    }

    pub fn commands(&self) -> &'static CommandTable {
        match self {
            Model::XjxToiletPro | Model::XjxToiletPure => &WHALE_COMMANDS,
        }
    }

    /// Picks the model to drive: the one the device reports if known, then the
    /// configured one, then the default.
    pub fn resolve(reported: Option<&str>, configured: Option<Model>) -> Model {
        if let Some(r) = reported.filter(|r| !r.is_empty()) {
            match Model::from_str(r) {
                Ok(m) => return m,
                Err(_) => warn!(
                    "Device reports unsupported model '{}', falling back to {}",
                    r,
                    configured.unwrap_or(DEFAULT_MODEL)
                ),
            }
        }
        configured.unwrap_or(DEFAULT_MODEL)
    }
}
