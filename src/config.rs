//! TOML configuration of the appliances to drive.

use crate::device::{DeviceBuilder, DeviceIdentity};
use crate::error::{MiioError, Result};
use crate::protocol::DEFAULT_PORT;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use tokio::time::Duration;

pub const DEFAULT_NAME: &str = "Xiaomi Whale Smart Toilet Cover";
const DEFAULT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub appliances: Vec<ApplianceConfig>,
}

/// One `[[appliances]]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplianceConfig {
    pub host: String,
    pub token: String,
    #[serde(default = "default_name")]
    pub name: String,
    /// Restricted to the known model identifiers
    #[serde(default)]
    pub model: Option<String>,
    /// Overrides the model's property allow-list
    #[serde(default)]
    pub properties: Option<Vec<String>>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_name() -> String {
    DEFAULT_NAME.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ApplianceConfig {
    /// Minimal configuration for one host, everything else defaulted.
    pub fn new<H: Into<String>, T: Into<String>>(host: H, token: T) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
            name: default_name(),
            model: None,
            properties: None,
            port: DEFAULT_PORT,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Validates host, token and model.
    pub fn identity(&self) -> Result<DeviceIdentity> {
        if self.timeout_secs == 0 {
            return Err(MiioError::Config(format!(
                "{}: timeout_secs must be positive",
                self.host
            )));
        }
        let mut builder = DeviceBuilder::new(self.host.as_str(), self.token.as_str())
            .port(self.port)
            .timeout(Duration::from_secs(self.timeout_secs));
        if let Some(model) = &self.model {
            builder = builder.model(model.as_str());
        }
        builder.identity()
    }
}

impl FromStr for Config {
    type Err = MiioError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| MiioError::Config(e.to_string()))?;
        for appliance in &config.appliances {
            appliance.identity()?;
        }
        Ok(config)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MiioError::Config(format!("{}: {}", path.display(), e)))?;
        text.parse()
    }

    /// Looks up an appliance by host.
    pub fn appliance(&self, host: &str) -> Option<&ApplianceConfig> {
        self.appliances.iter().find(|a| a.host == host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use std::io::Write;

    const TOKEN: &str = "00112233445566778899aabbccddeeff";

    #[test]
    fn parses_with_defaults() {
        let config: Config = format!(
            r#"
            [[appliances]]
            host = "192.168.1.50"
            token = "{TOKEN}"

            [[appliances]]
            host = "192.168.1.51"
            token = "{TOKEN}"
            name = "Bathroom"
            model = "xjx.toilet.pure"
            properties = ["seating"]
            port = 4321
            timeout_secs = 2
            "#
        )
        .parse()
        .unwrap();

        let first = &config.appliances[0];
        assert_eq!(first.name, DEFAULT_NAME);
        assert_eq!(first.port, DEFAULT_PORT);
        assert_eq!(first.model, None);
        assert_eq!(first.identity().unwrap().timeout(), Duration::from_secs(5));

        let second = config.appliance("192.168.1.51").unwrap();
        assert_eq!(second.properties.as_deref(), Some(&["seating".to_string()][..]));
        let identity = second.identity().unwrap();
        assert_eq!(identity.model(), Some(Model::XjxToiletPure));
        assert_eq!(identity.port(), 4321);
        assert_eq!(identity.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn rejects_invalid_entries() {
        let cases = [
            "[[appliances]]\nhost = \"10.0.0.2\"\n".to_string(),
            format!("[[appliances]]\nhost = \"10.0.0.2\"\ntoken = \"{}\"\n", &TOKEN[..30]),
            format!("[[appliances]]\nhost = \"10.0.0.2\"\ntoken = \"{TOKEN}\"\nmodel = \"xjx.toilet.zero\"\n"),
            format!("[[appliances]]\nhost = \"10.0.0.2\"\ntoken = \"{TOKEN}\"\ncolour = \"white\"\n"),
            format!("[[appliances]]\nhost = \"10.0.0.2\"\ntoken = \"{TOKEN}\"\ntimeout_secs = 0\n"),
        ];
        for case in cases {
            assert!(
                matches!(Config::from_str(&case), Err(MiioError::Config(_))),
                "{:?} should be rejected",
                case
            );
        }
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[appliances]]\nhost = \"10.0.0.7\"\ntoken = \"{TOKEN}\"\nname = \"Upstairs\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.appliances.len(), 1);
        assert_eq!(config.appliances[0].name, "Upstairs");
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::from_file(dir.path().join("absent.toml")),
            Err(MiioError::Config(_))
        ));
    }
}
