use crate::power::PowerAction;
use crate::registry::{DeviceId, PortId};
use std::fmt;

/// What a command asks the dispatcher to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Power(PowerAction),
    HealthCheck,
}

impl Action {
    pub fn class(&self) -> CommandClass {
        match self {
            Action::Power(_) => CommandClass::Normal,
            Action::HealthCheck => CommandClass::HealthCheck,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Power(action) => fmt::Display::fmt(action, f),
            Action::HealthCheck => f.write_str("healthcheck"),
        }
    }
}

/// Buffer lane; `HealthCheck` always drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    HealthCheck,
    Normal,
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandClass::HealthCheck => f.write_str("healthcheck"),
            CommandClass::Normal => f.write_str("normal"),
        }
    }
}

/// Producer-side command, not yet sequenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRequest {
    pub device_id: DeviceId,
    pub action: Action,
    pub port: Option<PortId>,
}

impl CommandRequest {
    pub fn power(device_id: DeviceId, port: PortId, action: PowerAction) -> Self {
        Self { device_id, action: Action::Power(action), port: Some(port) }
    }

    pub fn healthcheck(device_id: DeviceId) -> Self {
        Self { device_id, action: Action::HealthCheck, port: None }
    }
}

/// Command stamped by the buffer. `sequence` is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub device_id: DeviceId,
    pub action: Action,
    pub port: Option<PortId>,
    pub sequence: u64,
    pub class: CommandClass,
}

impl Command {
    pub(crate) fn stamp(request: CommandRequest, sequence: u64) -> Self {
        Self {
            device_id: request.device_id,
            action: request.action,
            port: request.port,
            sequence,
            class: request.action.class(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "#{} {} {:03} {:03}", self.sequence, self.action, self.device_id, port),
            None => write!(f, "#{} {} {:03}", self.sequence, self.action, self.device_id),
        }
    }
}
