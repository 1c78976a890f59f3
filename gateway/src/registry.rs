/**
 * DEVICE REGISTRY - Immutable catalogue of the PDUs the gateway controls
 *
 * ROLE: Turns the `devices` section of the configuration into flat,
 * fully-expanded descriptors (auth scheme, endpoint, outlet -> OID table,
 * power values). Outlet templates are expanded here and nowhere else.
 *
 * ARCHITECTURE: Built once per config load; a reload builds a new registry
 * and swaps the `RegistryHandle` snapshot, so lookups never see a half-built
 * registry.
 */

use crate::config::{
    CommunityConf, DeviceConf, DeviceSnmpConf, GatewayConfig, OutletTable, OutletsConf,
    ScalarConf, TemplateSources, UsmConf,
};
use crate::error::{ConfigError, GatewayError};
use crate::state::Snapshot;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub type DeviceId = u8;
pub type PortId = u8;
pub type RegistryHandle = Snapshot<DeviceRegistry>;

/// Literal integer written to an outlet OID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerValue(pub i32);

impl fmt::Display for PowerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerValues {
    pub on: PowerValue,
    pub off: PowerValue,
    pub cycle: Option<PowerValue>,
}

/// v1/v2c communities: `read` for GET, `write` for SET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Community {
    pub read: String,
    pub write: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    NoAuthNoPriv,
    AuthNoPriv,
    AuthPriv,
}

impl SecurityLevel {
    fn parse(level: &str) -> Option<Self> {
        match level {
            "noAuthNoPriv" => Some(Self::NoAuthNoPriv),
            "authNoPriv" => Some(Self::AuthNoPriv),
            "authPriv" => Some(Self::AuthPriv),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAuthNoPriv => "noAuthNoPriv",
            Self::AuthNoPriv => "authNoPriv",
            Self::AuthPriv => "authPriv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl AuthProtocol {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "SHA" | "SHA1" => Some(Self::Sha1),
            "SHA256" => Some(Self::Sha256),
            "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivProtocol {
    Aes128,
    Aes256,
}

impl PrivProtocol {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES" | "AES128" => Some(Self::Aes128),
            "AES256" => Some(Self::Aes256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsmKey<P> {
    pub protocol: P,
    pub passphrase: String,
}

/// SNMPv3 user, already masked down to what its security level uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsmUser {
    pub user: String,
    pub level: SecurityLevel,
    pub auth: Option<UsmKey<AuthProtocol>>,
    pub privacy: Option<UsmKey<PrivProtocol>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnmpAuth {
    V1(Community),
    V2(Community),
    V3(UsmUser),
}

impl SnmpAuth {
    pub fn version(&self) -> &'static str {
        match self {
            SnmpAuth::V1(_) => "v1",
            SnmpAuth::V2(_) => "v2c",
            SnmpAuth::V3(_) => "v3",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub name: String,
    pub transport: SocketAddr,
    pub auth: SnmpAuth,
    pub outlets: BTreeMap<PortId, String>,
    pub power_values: PowerValues,
    pub cycle_delay: Duration,
    pub healthcheck_oid: String,
}

impl DeviceDescriptor {
    pub fn lookup_oid(&self, port: PortId) -> Result<&str, GatewayError> {
        self.outlets
            .get(&port)
            .map(String::as_str)
            .ok_or(GatewayError::UnknownPort { device: self.id, port })
    }

    /// OID read by health-check probes
    pub fn probe_oid(&self) -> &str {
        &self.healthcheck_oid
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceDescriptor>,
}

impl DeviceRegistry {
    pub fn from_config(cfg: &GatewayConfig) -> Result<Self, ConfigError> {
        let templates = TemplateResolver { sources: &cfg.snmp.devices };
        let default_delay = cfg.cycle_delay();
        let mut devices = HashMap::with_capacity(cfg.devices.len());

        for (key, conf) in &cfg.devices {
            let id = key.to_u8("device")?;
            let descriptor = build_descriptor(id, key.to_string(), conf, &templates, default_delay)?;
            if devices.insert(id, descriptor).is_some() {
                return Err(ConfigError::DuplicateDevice { device: id });
            }
        }

        Ok(Self { devices })
    }

    pub fn resolve(&self, id: DeviceId) -> Result<&DeviceDescriptor, GatewayError> {
        self.devices.get(&id).ok_or(GatewayError::UnknownDevice(id))
    }

    pub fn lookup_oid<'a>(
        &self,
        device: &'a DeviceDescriptor,
        port: PortId,
    ) -> Result<&'a str, GatewayError> {
        device.lookup_oid(port)
    }

    /// Device ids in ascending order
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.devices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Re-reads the config file and builds a fresh registry from it
pub async fn load_registry(path: &Path) -> Result<DeviceRegistry, ConfigError> {
    let cfg = crate::config::load_config(path).await?;
    DeviceRegistry::from_config(&cfg)
}

/// `name := token (("-"|"_") token)*`, `token := [A-Za-z0-9]+`
pub fn is_valid_template_name(name: &str) -> bool {
    name.split(['-', '_'])
        .all(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn normalize_oid(raw: &str, context: impl FnOnce() -> String) -> Result<String, ConfigError> {
    let oid = raw.trim();
    let oid = oid.strip_prefix('.').unwrap_or(oid);
    let valid = !oid.is_empty()
        && oid.split('.').all(|arc| !arc.is_empty() && arc.bytes().all(|b| b.is_ascii_digit()));
    if valid {
        Ok(oid.to_string())
    } else {
        Err(ConfigError::InvalidOid { oid: raw.to_string(), context: context() })
    }
}

fn build_descriptor(
    id: DeviceId,
    name: String,
    conf: &DeviceConf,
    templates: &TemplateResolver<'_>,
    default_delay: Duration,
) -> Result<DeviceDescriptor, ConfigError> {
    let auth = build_auth(&name, &conf.snmp)?;
    let outlets = match &conf.outlets {
        OutletsConf::Table(table) => outlet_table(&name, table)?,
        OutletsConf::Template(template) => templates.resolve(&name, template)?,
    };
    let power_values = build_power_values(&name, &conf.power_states)?;

    let healthcheck_oid = match &conf.healthcheck_oid {
        Some(oid) => normalize_oid(oid, || format!("device {name} healthcheck_oid"))?,
        None => outlets
            .values()
            .next()
            .cloned()
            .ok_or_else(|| ConfigError::NoOutlets { device: name.clone() })?,
    };

    Ok(DeviceDescriptor {
        id,
        transport: SocketAddr::new(conf.snmp.ip_address, conf.snmp.port),
        auth,
        outlets,
        power_values,
        cycle_delay: conf.cy_delay.map(Duration::from_secs).unwrap_or(default_delay),
        healthcheck_oid,
        name,
    })
}

fn build_auth(device: &str, snmp: &DeviceSnmpConf) -> Result<SnmpAuth, ConfigError> {
    let declared = [snmp.v1.is_some(), snmp.v2.is_some(), snmp.v3.is_some()]
        .iter()
        .filter(|present| **present)
        .count();
    if declared > 1 {
        return Err(ConfigError::AmbiguousAuth { device: device.to_string() });
    }

    let community = |c: &CommunityConf| Community {
        read: c.public_community.clone(),
        write: c.private_community.clone(),
    };

    match (&snmp.v1, &snmp.v2, &snmp.v3) {
        (Some(v1), _, _) => Ok(SnmpAuth::V1(community(v1))),
        (_, Some(v2), _) => Ok(SnmpAuth::V2(community(v2))),
        (_, _, Some(v3)) => build_usm(device, v3).map(SnmpAuth::V3),
        _ => Err(ConfigError::MissingAuth { device: device.to_string() }),
    }
}

fn build_usm(device: &str, v3: &UsmConf) -> Result<UsmUser, ConfigError> {
    let raw_level = v3.security_level.as_deref().unwrap_or("(missing)");
    let level = SecurityLevel::parse(raw_level).ok_or_else(|| ConfigError::InvalidSecurityLevel {
        device: device.to_string(),
        level: raw_level.to_string(),
    })?;

    let required = |value: &Option<String>, field: &'static str| {
        value.clone().ok_or(ConfigError::MissingCredential {
            device: device.to_string(),
            level: level.as_str(),
            field,
        })
    };

    let auth = if matches!(level, SecurityLevel::AuthNoPriv | SecurityLevel::AuthPriv) {
        let name = required(&v3.auth_protocol, "auth_protocol")?;
        let protocol = AuthProtocol::parse(&name).ok_or_else(|| ConfigError::UnsupportedProtocol {
            device: device.to_string(),
            kind: "auth",
            value: name.clone(),
        })?;
        Some(UsmKey { protocol, passphrase: required(&v3.auth_passphrase, "auth_passphrase")? })
    } else {
        None
    };

    let privacy = if level == SecurityLevel::AuthPriv {
        let name = required(&v3.priv_protocol, "priv_protocol")?;
        let protocol = PrivProtocol::parse(&name).ok_or_else(|| ConfigError::UnsupportedProtocol {
            device: device.to_string(),
            kind: "privacy",
            value: name.clone(),
        })?;
        Some(UsmKey { protocol, passphrase: required(&v3.priv_passphrase, "priv_passphrase")? })
    } else {
        None
    };

    Ok(UsmUser { user: v3.user.clone(), level, auth, privacy })
}

fn build_power_values(
    device: &str,
    states: &BTreeMap<String, ScalarConf>,
) -> Result<PowerValues, ConfigError> {
    let (mut on, mut off, mut cycle) = (None, None, None);

    for (state, raw) in states {
        let value = raw.as_i32().map(PowerValue).ok_or_else(|| ConfigError::InvalidPowerValue {
            device: device.to_string(),
            state: state.clone(),
            value: raw.as_text(),
        })?;
        match state.as_str() {
            "on" => on = Some(value),
            "of" => off = Some(value),
            "cy" => cycle = Some(value),
            other => {
                return Err(ConfigError::UnknownPowerState {
                    device: device.to_string(),
                    state: other.to_string(),
                })
            }
        }
    }

    let missing = |state| ConfigError::MissingPowerState { device: device.to_string(), state };
    Ok(PowerValues {
        on: on.ok_or_else(|| missing("on"))?,
        off: off.ok_or_else(|| missing("of"))?,
        cycle,
    })
}

/// `1` and `"001"` name the same port, so both in one table is an error
fn outlet_table(device: &str, table: &OutletTable) -> Result<BTreeMap<PortId, String>, ConfigError> {
    let mut outlets = BTreeMap::new();
    for (key, oid) in table {
        let port = key.to_u8("port")?;
        let oid = normalize_oid(&oid.as_text(), || format!("device {device} port {port:03}"))?;
        if outlets.insert(port, oid).is_some() {
            return Err(ConfigError::DuplicatePort { device: device.to_string(), port });
        }
    }
    Ok(outlets)
}

struct TemplateResolver<'a> {
    sources: &'a TemplateSources,
}

impl TemplateResolver<'_> {
    /// Inline `custom` templates win over `<path>/<name>.yaml`
    fn resolve(&self, device: &str, template: &str) -> Result<BTreeMap<PortId, String>, ConfigError> {
        if !is_valid_template_name(template) {
            return Err(ConfigError::InvalidTemplateName(template.to_string()));
        }

        if let Some(table) = self.sources.custom.get(template) {
            return outlet_table(device, table);
        }

        let unresolved = || ConfigError::UnresolvedTemplate {
            device: device.to_string(),
            template: template.to_string(),
            path: self.sources.path.clone(),
        };
        let dir = self.sources.path.as_deref().ok_or_else(unresolved)?;
        match load_template_file(dir, template)? {
            Some(table) => outlet_table(device, &table),
            None => Err(unresolved()),
        }
    }
}

fn load_template_file(dir: &Path, template: &str) -> Result<Option<OutletTable>, ConfigError> {
    let file = dir.join(format!("{template}.yaml"));
    let text = match std::fs::read_to_string(&file) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(ConfigError::Io { path: file, source }),
    };
    serde_yaml::from_str(&text)
        .map(Some)
        .map_err(|source| ConfigError::Yaml { origin: file.display().to_string(), source })
}
