use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const CONFIG_ENV: &str = "PDU_GATEWAY_CONFIG";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    pub serial: SerialConf,
    pub snmp: SnmpConf,
    pub healthcheck: HealthcheckConf,
    pub power_states: PowerStatesConf,
    #[serde(default)]
    pub dispatch: DispatchConf,
    #[serde(default)]
    pub logging: LoggingConf,
    #[serde(default)]
    pub status: StatusConf,
    pub devices: BTreeMap<ConfigKey, DeviceConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SerialConf {
    pub device: PathBuf,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SnmpConf {
    pub retry: RetryConf,
    #[serde(default)]
    pub devices: TemplateSources,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct RetryConf {
    pub max_attempts: u32,
    pub delay: u64,
    pub timeout: u64,
}

/// Where named outlet templates come from: inline first, then `<path>/<name>.yaml`
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TemplateSources {
    #[serde(default)]
    pub custom: BTreeMap<String, OutletTable>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct HealthcheckConf {
    pub frequency: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct PowerStatesConf {
    pub cy_delay: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default)]
pub struct DispatchConf {
    pub capacity: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConf {
    #[serde(default = "default_log_destination")]
    pub destination: String, // stream | file
    #[serde(default = "default_log_target")]
    pub target: String, // stdout | stderr | file path
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct StatusConf {
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConf {
    pub snmp: DeviceSnmpConf,
    pub outlets: OutletsConf,
    pub power_states: BTreeMap<String, ScalarConf>,
    pub cy_delay: Option<u64>,
    pub healthcheck_oid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceSnmpConf {
    pub ip_address: IpAddr,
    #[serde(default = "default_snmp_port")]
    pub port: u16,
    pub v1: Option<CommunityConf>,
    pub v2: Option<CommunityConf>,
    pub v3: Option<UsmConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommunityConf {
    pub public_community: String,
    pub private_community: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UsmConf {
    pub user: String,
    pub security_level: Option<String>,
    pub auth_protocol: Option<String>,
    pub auth_passphrase: Option<String>,
    pub priv_protocol: Option<String>,
    pub priv_passphrase: Option<String>,
}

/// Outlet field of a device: either a template name or an inline table
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum OutletsConf {
    Template(String),
    Table(OutletTable),
}

pub type OutletTable = BTreeMap<ConfigKey, ScalarConf>;

/// Bank/port key, written either `1` or `"001"` in YAML
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(untagged)]
pub enum ConfigKey {
    Number(u64),
    Text(String),
}

/// Scalar that YAML may hand back as an integer or a string
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ScalarConf {
    Integer(i64),
    Text(String),
}

impl ConfigKey {
    pub fn to_u8(&self, kind: &'static str) -> Result<u8, ConfigError> {
        let parsed = match self {
            ConfigKey::Number(n) => u8::try_from(*n).ok(),
            ConfigKey::Text(s) => s.trim().parse::<u8>().ok(),
        };
        parsed.ok_or_else(|| ConfigError::InvalidKey {
            kind,
            key: self.to_string(),
        })
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigKey::Number(n) => write!(f, "{n:03}"),
            ConfigKey::Text(s) => f.write_str(s),
        }
    }
}

impl ScalarConf {
    pub fn as_text(&self) -> String {
        match self {
            ScalarConf::Integer(n) => n.to_string(),
            ScalarConf::Text(s) => s.trim().to_string(),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ScalarConf::Integer(n) => i32::try_from(*n).ok(),
            ScalarConf::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl GatewayConfig {
    pub fn healthcheck_interval(&self) -> Result<Duration, ConfigError> {
        if self.healthcheck.frequency == 0 {
            return Err(ConfigError::ZeroFrequency);
        }
        Ok(Duration::from_secs(self.healthcheck.frequency))
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.power_states.cy_delay)
    }
}

impl Default for LoggingConf {
    fn default() -> Self {
        Self {
            destination: default_log_destination(),
            target: default_log_target(),
            level: default_log_level(),
        }
    }
}

impl Default for StatusConf {
    fn default() -> Self {
        Self { report_interval: default_report_interval() }
    }
}

fn default_reconnect_delay() -> u64 { 5 }
fn default_snmp_port() -> u16 { 161 }
fn default_log_destination() -> String { "stream".into() }
fn default_log_target() -> String { "stdout".into() }
fn default_log_level() -> String { "info".into() }
fn default_report_interval() -> u64 { 300 }

/// Config file location: `PDU_GATEWAY_CONFIG`, falling back to `./config.yaml`
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"))
}

pub fn parse_config(text: &str, origin: &str) -> Result<GatewayConfig, ConfigError> {
    serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
        origin: origin.to_string(),
        source,
    })
}

pub async fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&txt, &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const INLINE_OUTLETS: &str = "
      1: 1.3.6.1.4.1.850.1.1.3.2.3.3.1.1.4.1.1
      \"002\": 1.3.6.1.4.1.850.1.1.3.2.3.3.1.1.4.1.2";

    fn fixture(outlets: &str) -> String {
        format!(
            r#"
serial:
  device: /dev/ttyUSB0
snmp:
  retry: {{ max_attempts: 3, delay: 5, timeout: 5 }}
healthcheck:
  frequency: 5
power_states:
  cy_delay: 5
devices:
  "001":
    snmp:
      ip_address: 127.0.0.1
      v1: {{ public_community: public, private_community: private }}
    outlets: {outlets}
    power_states: {{ on: 2, of: "1" }}
"#
        )
    }

    #[test]
    fn test_parse_minimal_config() {
        let cfg = parse_config(&fixture(INLINE_OUTLETS), "inline").unwrap();
        assert_eq!(cfg.snmp.retry.max_attempts, 3);
        assert_eq!(cfg.serial.reconnect_delay, 5);
        assert_eq!(cfg.logging.destination, "stream");
        assert_eq!(cfg.status.report_interval, 300);
        assert!(cfg.dispatch.capacity.is_none());

        let (key, device) = cfg.devices.iter().next().unwrap();
        assert_eq!(key.to_u8("device").unwrap(), 1);
        assert_eq!(device.snmp.port, 161);
        match &device.outlets {
            OutletsConf::Table(table) => assert_eq!(table.len(), 2),
            OutletsConf::Template(name) => panic!("unexpected template {name}"),
        }
        assert_eq!(device.power_states["of"].as_i32(), Some(1));
    }

    #[test]
    fn test_outlets_template_reference() {
        let text = fixture("tripplite-8");
        let cfg = parse_config(&text, "inline").unwrap();
        let device = cfg.devices.values().next().unwrap();
        assert!(matches!(&device.outlets, OutletsConf::Template(name) if name == "tripplite-8"));
    }

    #[test]
    fn test_config_key_bounds() {
        assert_eq!(ConfigKey::Text("007".into()).to_u8("port").unwrap(), 7);
        assert_eq!(ConfigKey::Number(255).to_u8("port").unwrap(), 255);
        assert!(ConfigKey::Number(256).to_u8("port").is_err());
        assert!(ConfigKey::Text("-1".into()).to_u8("port").is_err());
        assert!(ConfigKey::Text("abc".into()).to_u8("bank").is_err());
        assert_eq!(ConfigKey::Number(4).to_string(), "004");
    }

    #[test]
    fn test_zero_frequency_rejected() {
        let mut cfg = parse_config(&fixture(INLINE_OUTLETS), "inline").unwrap();
        cfg.healthcheck.frequency = 0;
        assert!(matches!(cfg.healthcheck_interval(), Err(ConfigError::ZeroFrequency)));
    }

    #[test]
    fn test_invalid_yaml_reports_origin() {
        let err = parse_config("serial: [", "broken.yaml").unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/pdu-gateway.yaml")).await.unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
