//! Error types shared across the gateway.
//!
//! Configuration problems are fatal at startup; lookup failures reject a
//! command before it reaches the buffer. SNMP failures live in [`crate::snmp`]
//! because they never leave the dispatch loop.

use crate::command::CommandClass;
use crate::registry::{DeviceId, PortId};
use std::path::PathBuf;

/// Anything that makes a configuration snapshot unusable
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {origin}: {source}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("device {device} declares more than one SNMP auth scheme")]
    AmbiguousAuth { device: String },
    #[error("device {device} declares no SNMP auth scheme (expected one of v1, v2, v3)")]
    MissingAuth { device: String },
    #[error("device {device}: v3 security level '{level}' is not one of noAuthNoPriv, authNoPriv, authPriv")]
    InvalidSecurityLevel { device: String, level: String },
    #[error("device {device}: security level {level} requires {field}")]
    MissingCredential {
        device: String,
        level: &'static str,
        field: &'static str,
    },
    #[error("device {device}: unsupported {kind} protocol '{value}'")]
    UnsupportedProtocol {
        device: String,
        kind: &'static str,
        value: String,
    },
    #[error("'{0}' is not a valid template name")]
    InvalidTemplateName(String),
    #[error("device {device}: template '{template}' not found inline or under {path:?}")]
    UnresolvedTemplate {
        device: String,
        template: String,
        path: Option<PathBuf>,
    },
    #[error("'{key}' is not a valid {kind} number (expected 0-255)")]
    InvalidKey { kind: &'static str, key: String },
    #[error("device {device} is declared twice")]
    DuplicateDevice { device: DeviceId },
    #[error("device {device}: port {port:03} is listed more than once")]
    DuplicatePort { device: String, port: PortId },
    #[error("'{oid}' is not a dotted-decimal OID ({context})")]
    InvalidOid { oid: String, context: String },
    #[error("device {device}: power state '{state}' is required")]
    MissingPowerState { device: String, state: &'static str },
    #[error("device {device}: unknown power state '{state}' (expected on, of, cy)")]
    UnknownPowerState { device: String, state: String },
    #[error("device {device}: power state '{state}' value '{value}' is not an integer")]
    InvalidPowerValue {
        device: String,
        state: String,
        value: String,
    },
    #[error("device {device} has no outlets, nothing to probe")]
    NoOutlets { device: String },
    #[error("retry.max_attempts must be at least 1")]
    NoAttempts,
    #[error("healthcheck.frequency must be greater than zero")]
    ZeroFrequency,
    #[error("unsupported logging destination '{0}' (expected stream or file)")]
    UnsupportedLogDestination(String),
}

/// Errors surfaced to producers when a request cannot enter the buffer
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown device {0:03}")]
    UnknownDevice(DeviceId),
    #[error("device {device:03} has no port {port:03}")]
    UnknownPort { device: DeviceId, port: PortId },
    #[error(transparent)]
    BufferFull(#[from] BufferFull),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The command buffer is at capacity for this class
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("command buffer full, {class} command rejected")]
pub struct BufferFull {
    pub class: CommandClass,
}
