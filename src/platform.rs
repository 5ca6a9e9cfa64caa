//! Host-side glue: entity presentation, the appliance registry and service
//! call dispatch.

use crate::config::ApplianceConfig;
use crate::controller::{ApplianceController, EntityState, normalize_params};
use crate::device::DeviceClient;
use crate::error::{MiioError, Result};
use crate::model::Model;
use crate::status::DeviceStatus;
use futures_util::future::join_all;
use log::{debug, error, info};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

pub const DOMAIN: &str = "toiletlid";
pub const ICON: &str = "mdi:toilet";

pub const SERVICE_SEND_COMMAND: &str = "send_command";
pub const SERVICE_SELF_CLEAN_ON: &str = "self_clean_on";
pub const SERVICE_SELF_CLEAN_OFF: &str = "self_clean_off";
pub const SERVICE_LED_ON: &str = "led_on";
pub const SERVICE_LED_OFF: &str = "led_off";
pub const SERVICE_LIGHT_ON: &str = "light_on";
pub const SERVICE_LIGHT_OFF: &str = "light_off";

/// Every service name accepted by [`ServiceCall::from_service`].
pub const SERVICES: &[&str] = &[
    SERVICE_SEND_COMMAND,
    SERVICE_SELF_CLEAN_ON,
    SERVICE_SELF_CLEAN_OFF,
    SERVICE_LED_ON,
    SERVICE_LED_OFF,
    SERVICE_LIGHT_ON,
    SERVICE_LIGHT_OFF,
];

const ATTR_ENTITY_ID: &str = "entity_id";
const ATTR_COMMAND: &str = "command";
const ATTR_PARAMS: &str = "params";

/// One toilet lid as presented to the host.
pub struct ToiletlidEntity {
    name: String,
    unique_id: String,
    entity_id: String,
    host: String,
    controller: ApplianceController,
}

impl ToiletlidEntity {
    pub fn new<N: Into<String>, U: Into<String>>(
        name: N,
        unique_id: U,
        controller: ApplianceController,
    ) -> Self {
        let name = name.into();
        let host = controller.client().identity().host().to_string();
        Self {
            entity_id: format!("{}.{}", DOMAIN, slugify(&name)),
            name,
            unique_id: unique_id.into(),
            host,
            controller,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<model>-<mac>`
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn icon(&self) -> &'static str {
        ICON
    }

    pub fn model(&self) -> Model {
        self.controller.model()
    }

    pub fn available(&self) -> bool {
        self.controller.state().available()
    }

    pub fn is_on(&self) -> Option<bool> {
        self.controller.state().is_on()
    }

    pub fn state(&self) -> EntityState {
        self.controller.state().state()
    }

    /// The model's attribute set; unknown values are `null`.
    pub fn attributes(&self) -> Map<String, Value> {
        self.controller
            .state()
            .attributes()
            .iter()
            .map(|(name, value)| (name.to_string(), value.map_or(Value::Null, Value::Bool)))
            .collect()
    }

    pub fn controller(&self) -> &ApplianceController {
        &self.controller
    }

    /// Polls the device; see [`ApplianceController::refresh`].
    pub async fn update(&mut self) -> Option<DeviceStatus> {
        self.controller.refresh().await
    }

    /// Everything the host shows for this entity.
    pub fn snapshot(&self) -> Value {
        json!({
            "entity_id": self.entity_id,
            "name": self.name,
            "unique_id": self.unique_id,
            "icon": ICON,
            "available": self.available(),
            "state": self.state().as_str(),
            "attributes": self.attributes(),
        })
    }

    async fn execute(&mut self, call: &ServiceCall) -> bool {
        match call {
            ServiceCall::SendCommand {
                command, params, ..
            } => self
                .controller
                .send_raw_command(command, params.clone())
                .await
                .unwrap_or(false),
            ServiceCall::SelfClean { on, .. } => self.controller.set_self_clean(*on).await,
            ServiceCall::Light { on, .. } => self.controller.set_light(*on).await,
        }
    }
}

impl std::fmt::Debug for ToiletlidEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToiletlidEntity")
            .field("entity_id", &self.entity_id)
            .field("unique_id", &self.unique_id)
            .field("host", &self.host)
            .field("state", &self.state())
            .finish()
    }
}

fn slugify(s: &str) -> String {
    let slug = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<&str>>()
        .join("_");
    if slug.is_empty() {
        DOMAIN.to_string()
    } else {
        slug
    }
}

/// Connects to a configured appliance and performs the first refresh.
///
/// Fails with [`MiioError::Config`] on invalid settings, and with
/// [`MiioError::NotReady`] when the device cannot be queried; the host is
/// expected to retry the latter later.
pub async fn setup(config: &ApplianceConfig) -> Result<ToiletlidEntity> {
    let identity = config.identity()?;
    info!(
        "Initializing with host {} (token {}...)",
        identity.host(),
        identity.token_hint()
    );

    let configured = identity.model();
    let mut client = DeviceClient::new(identity)?;
    let device_info = client.info().await.map_err(|e| {
        error!("Unable to query {}: {}", config.host, e);
        MiioError::NotReady(format!("{}: {}", config.host, e))
    })?;
    debug!("Device info of {}: {:?}", config.host, device_info);

    let model = Model::resolve(device_info.model.as_deref(), configured);
    let unique_id = format!(
        "{}-{}",
        model,
        device_info.mac.as_deref().unwrap_or("unknown")
    );

    let mut controller = ApplianceController::new(client, model);
    if let Some(properties) = &config.properties {
        controller = controller.with_properties(properties.clone());
    }

    let mut entity = ToiletlidEntity::new(config.name.as_str(), unique_id, controller);
    entity.update().await;
    Ok(entity)
}

/// A parsed host service invocation.
///
/// `entity_ids` of `None` targets every registered appliance.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    SendCommand {
        command: String,
        params: Option<Value>,
        entity_ids: Option<Vec<String>>,
    },
    SelfClean {
        on: bool,
        entity_ids: Option<Vec<String>>,
    },
    Light {
        on: bool,
        entity_ids: Option<Vec<String>>,
    },
}

impl ServiceCall {
    /// Parses a service name and its data object.
    pub fn from_service(service: &str, data: &Value) -> Result<Self> {
        let empty = Map::new();
        let fields = match data {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(MiioError::ParamParse(format!(
                    "service data must be an object, got {}",
                    other
                )));
            }
        };

        let allowed: &[&str] = match service {
            SERVICE_SEND_COMMAND => &[ATTR_ENTITY_ID, ATTR_COMMAND, ATTR_PARAMS],
            s if SERVICES.contains(&s) => &[ATTR_ENTITY_ID],
            other => return Err(MiioError::UnknownService(other.to_string())),
        };
        if let Some(key) = fields.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(MiioError::ParamParse(format!(
                "unexpected field '{}' for service {}",
                key, service
            )));
        }

        let entity_ids = parse_entity_ids(fields.get(ATTR_ENTITY_ID))?;
        Ok(match service {
            SERVICE_SEND_COMMAND => {
                let command = fields
                    .get(ATTR_COMMAND)
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        MiioError::ParamParse(format!("{} requires a command name", service))
                    })?;
                ServiceCall::SendCommand {
                    command: command.to_string(),
                    params: fields.get(ATTR_PARAMS).filter(|p| !p.is_null()).cloned(),
                    entity_ids,
                }
            }
            SERVICE_SELF_CLEAN_ON | SERVICE_SELF_CLEAN_OFF => ServiceCall::SelfClean {
                on: service == SERVICE_SELF_CLEAN_ON,
                entity_ids,
            },
            _ => ServiceCall::Light {
                on: service == SERVICE_LED_ON || service == SERVICE_LIGHT_ON,
                entity_ids,
            },
        })
    }

    pub fn entity_ids(&self) -> Option<&[String]> {
        match self {
            ServiceCall::SendCommand { entity_ids, .. }
            | ServiceCall::SelfClean { entity_ids, .. }
            | ServiceCall::Light { entity_ids, .. } => entity_ids.as_deref(),
        }
    }
}

fn parse_entity_ids(value: Option<&Value>) -> Result<Option<Vec<String>>> {
    let invalid = || MiioError::ParamParse(format!("invalid {}: {:?}", ATTR_ENTITY_ID, value));
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(
            s.split(',')
                .map(|id| id.trim().to_lowercase())
                .filter(|id| !id.is_empty())
                .collect(),
        )),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(|id| id.trim().to_lowercase()))
            .collect::<Option<Vec<_>>>()
            .map(Some)
            .ok_or_else(invalid),
        Some(_) => Err(invalid()),
    }
}

/// Per-entity result of a dispatched service call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceOutcome {
    pub entity_id: String,
    pub success: bool,
}

/// Set-up appliances keyed by host.
#[derive(Debug, Default)]
pub struct ApplianceRegistry {
    entities: BTreeMap<String, ToiletlidEntity>,
}

impl ApplianceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity, replacing any previous one for the same host.
    ///
    /// Entity ids are kept unique by suffixing `_2`, `_3`, ...
    pub fn insert(&mut self, mut entity: ToiletlidEntity) -> Option<ToiletlidEntity> {
        let base = entity.entity_id.clone();
        let mut n = 1;
        while self
            .entities
            .values()
            .any(|e| e.host != entity.host && e.entity_id == entity.entity_id)
        {
            n += 1;
            entity.entity_id = format!("{}_{}", base, n);
        }
        info!(
            "Registered {} ({}) for host {}",
            entity.entity_id, entity.unique_id, entity.host
        );
        self.entities.insert(entity.host.clone(), entity)
    }

    /// Sets up the appliance and registers it.
    pub async fn add(&mut self, config: &ApplianceConfig) -> Result<&ToiletlidEntity> {
        let entity = setup(config).await?;
        let host = entity.host.clone();
        self.insert(entity);
        self.entities
            .get(&host)
            .ok_or_else(|| MiioError::EntityNotFound(host))
    }

    pub fn remove(&mut self, host: &str) -> Option<ToiletlidEntity> {
        self.entities.remove(host)
    }

    pub fn get(&self, host: &str) -> Option<&ToiletlidEntity> {
        self.entities.get(host)
    }

    pub fn by_entity_id(&self, entity_id: &str) -> Option<&ToiletlidEntity> {
        self.entities.values().find(|e| e.entity_id == entity_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities in host order.
    pub fn iter(&self) -> impl Iterator<Item = &ToiletlidEntity> {
        self.entities.values()
    }

    /// Refreshes every registered appliance concurrently.
    pub async fn update_all(&mut self) {
        join_all(self.entities.values_mut().map(|e| e.update())).await;
    }

    /// Runs a service call on its target appliances, then refreshes them.
    ///
    /// Unknown entity ids and malformed raw-command parameters are rejected
    /// before any device is contacted.
    pub async fn dispatch(&mut self, call: &ServiceCall) -> Result<Vec<ServiceOutcome>> {
        if let ServiceCall::SendCommand {
            command, params, ..
        } = call
        {
            normalize_params(params.clone())
                .inspect_err(|e| error!("Rejected raw command {}: {}", command, e))?;
        }
        let hosts = self.resolve_targets(call.entity_ids())?;
        debug!("Dispatching {:?} to {:?}", call, hosts);

        let mut outcomes = Vec::with_capacity(hosts.len());
        for host in &hosts {
            if let Some(entity) = self.entities.get_mut(host) {
                let success = entity.execute(call).await;
                outcomes.push(ServiceOutcome {
                    entity_id: entity.entity_id.clone(),
                    success,
                });
            }
        }

        join_all(
            self.entities
                .values_mut()
                .filter(|e| hosts.contains(&e.host))
                .map(|e| e.update()),
        )
        .await;
        Ok(outcomes)
    }

    fn resolve_targets(&self, entity_ids: Option<&[String]>) -> Result<Vec<String>> {
        let Some(ids) = entity_ids else {
            return Ok(self.entities.keys().cloned().collect());
        };
        let mut hosts = Vec::with_capacity(ids.len());
        for id in ids {
            let entity = self
                .by_entity_id(id)
                .ok_or_else(|| MiioError::EntityNotFound(id.clone()))?;
            if !hosts.contains(&entity.host) {
                hosts.push(entity.host.clone());
            }
        }
        Ok(hosts)
    }
}
