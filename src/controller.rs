//! Appliance operations on top of [`DeviceClient`]: status refresh with a
//! cached entity state, self-clean and night-light switches, raw commands.

use crate::device::DeviceClient;
use crate::error::{MiioError, Result};
use crate::model::Model;
use crate::status::DeviceStatus;
use log::{debug, error, warn};
use serde_json::{Value, json};

/// Firmware answers reliably only when asked for one property at a time.
pub const MAX_PROPERTIES_PER_REQUEST: usize = 1;

/// Returns true if a command reply is the `["ok"]` success sentinel.
pub fn is_success(reply: &Value) -> bool {
    matches!(reply.as_array().map(Vec::as_slice), Some([Value::String(s)]) if s == "ok")
}

/// State reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Unavailable,
    Occupied,
    Idle,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::Unavailable => "unavailable",
            EntityState::Occupied => "occupied",
            EntityState::Idle => "idle",
        }
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last-known availability and attributes.
///
/// Attributes keep their last observed value when a refresh fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntityState {
    available: bool,
    is_on: Option<bool>,
    attributes: Vec<(&'static str, Option<bool>)>,
}

impl CachedEntityState {
    fn new(model: Model) -> Self {
        Self {
            available: false,
            is_on: None,
            attributes: model
                .attributes()
                .iter()
                .map(|(name, _)| (*name, None))
                .collect(),
        }
    }

    pub fn available(&self) -> bool {
        self.available
    }

    pub fn is_on(&self) -> Option<bool> {
        self.is_on
    }

    /// Attribute names in model order with their last-known values.
    pub fn attributes(&self) -> &[(&'static str, Option<bool>)] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<bool> {
        self.attributes
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, v)| *v)
    }

    pub fn state(&self) -> EntityState {
        match (self.available, self.is_on) {
            (false, _) => EntityState::Unavailable,
            (true, Some(true)) => EntityState::Occupied,
            (true, _) => EntityState::Idle,
        }
    }

    fn apply(&mut self, model: Model, status: &DeviceStatus) {
        self.available = true;
        if let Some(on) = status.is_on() {
            self.is_on = Some(on);
        }
        for ((_, field), (_, slot)) in model.attributes().iter().zip(self.attributes.iter_mut()) {
            if let Some(value) = status.field(*field) {
                *slot = Some(value);
            }
        }
    }
}

/// Normalizes raw-command parameters before they are sent.
///
/// Missing or `null` parameters become `[]`, a scalar becomes a one-element
/// list. A one-element list holding a string that contains `[` or `]`, or
/// starts with `{`, is parsed as JSON and must yield a list or an object. A
/// one-element list holding an all-digit string becomes that integer; digit
/// strings beyond `u64::MAX` are forwarded unchanged.
pub fn normalize_params(params: Option<Value>) -> Result<Value> {
    let params = match params {
        None | Some(Value::Null) => return Ok(json!([])),
        Some(v @ (Value::Array(_) | Value::Object(_))) => v,
        Some(scalar) => json!([scalar]),
    };

    let single = match &params {
        Value::Array(items) if items.len() == 1 => items[0].as_str().map(str::to_owned),
        _ => None,
    };
    let Some(s) = single else {
        return Ok(params);
    };

    if looks_like_json(&s) {
        let parsed: Value = serde_json::from_str(&s)
            .map_err(|e| MiioError::ParamParse(format!("{:?} is not valid JSON: {}", s, e)))?;
        return match parsed {
            Value::Array(_) | Value::Object(_) => Ok(parsed),
            other => Err(MiioError::ParamParse(format!(
                "{:?} must be a JSON list or object, got {}",
                s, other
            ))),
        };
    }
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
        return Ok(match s.parse::<u64>() {
            Ok(n) => json!([n]),
            Err(_) => params,
        });
    }
    Ok(params)
}

fn looks_like_json(s: &str) -> bool {
    s.contains(|c: char| c == '[' || c == ']') || s.trim_start().starts_with('{')
}

/// Public operations of one toilet lid.
///
/// Only [`refresh`](Self::refresh) changes availability; the switch and raw
/// command operations report success as a boolean and leave the cache alone.
pub struct ApplianceController {
    client: DeviceClient,
    model: Model,
    properties: Vec<String>,
    state: CachedEntityState,
}

impl ApplianceController {
    pub fn new(client: DeviceClient, model: Model) -> Self {
        Self {
            client,
            model,
            properties: model.properties().iter().map(|p| p.to_string()).collect(),
            state: CachedEntityState::new(model),
        }
    }

    /// Replaces the model's property allow-list.
    pub fn with_properties(mut self, properties: Vec<String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn model(&self) -> Model {
        self.model
    }

    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub fn state(&self) -> &CachedEntityState {
        &self.state
    }

    pub fn client(&self) -> &DeviceClient {
        &self.client
    }

    /// Polls the allow-listed properties and updates the cache.
    ///
    /// On failure the appliance is marked unavailable and the error is logged;
    /// cached attributes are left untouched.
    pub async fn refresh(&mut self) -> Option<DeviceStatus> {
        let result = match self
            .client
            .get_properties(&self.properties, MAX_PROPERTIES_PER_REQUEST)
            .await
        {
            Ok(values) => DeviceStatus::from_values(&self.properties, values),
            Err(e) => Err(e),
        };

        match result {
            Ok(status) => {
                debug!("Got new state: {:?}", status);
                self.state.apply(self.model, &status);
                Some(status)
            }
            Err(e) => {
                self.state.available = false;
                if matches!(e, MiioError::Auth(_)) {
                    error!(
                        "Got exception while fetching the state of {}: {} (is the token correct?)",
                        self.client.identity().host(),
                        e
                    );
                } else {
                    error!(
                        "Got exception while fetching the state of {}: {}",
                        self.client.identity().host(),
                        e
                    );
                }
                None
            }
        }
    }

    pub async fn set_self_clean(&mut self, on: bool) -> bool {
        let (command, params) = self.model.commands().self_clean(on);
        let mask = if on {
            "Unable to set self clean on"
        } else {
            "Unable to set self clean off"
        };
        self.try_command(mask, command, params).await
    }

    pub async fn set_light(&mut self, on: bool) -> bool {
        let (command, params) = self.model.commands().light(on);
        let mask = if on {
            "Unable to set light on"
        } else {
            "Unable to set light off"
        };
        self.try_command(mask, command, params).await
    }

    /// Sends an arbitrary command after [`normalize_params`].
    ///
    /// Malformed parameters are rejected with [`MiioError::ParamParse`] before
    /// anything is sent; every other failure yields `Ok(false)`.
    pub async fn send_raw_command(&mut self, command: &str, params: Option<Value>) -> Result<bool> {
        let params = normalize_params(params)
            .inspect_err(|e| error!("Rejected raw command {}: {}", command, e))?;
        Ok(self
            .try_command("Unable to send raw command to the device", command, params)
            .await)
    }

    async fn try_command(&mut self, mask_error: &str, command: &str, params: Value) -> bool {
        match self.client.send_command(command, params).await {
            Ok(reply) => {
                let ok = is_success(&reply);
                if !ok {
                    warn!("Command {} was not acknowledged: {}", command, reply);
                }
                ok
            }
            Err(e) => {
                error!("{}: {}", mask_error, e);
                false
            }
        }
    }
}
