//! Power-state resolution.
//!
//! Maps a logical action onto the literal SET values a device understands.
//! Devices without a native cycle value get an OFF, wait, ON sequence; the
//! wait is carried on the step so the dispatcher can honour it.

use crate::registry::{DeviceDescriptor, PowerValue};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerAction {
    On,
    Off,
    Cycle,
}

impl PowerAction {
    /// Serial op code, also the `power_states` key
    pub fn code(&self) -> &'static str {
        match self {
            PowerAction::On => "on",
            PowerAction::Off => "of",
            PowerAction::Cycle => "cy",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for PowerAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(PowerAction::On),
            "of" => Ok(PowerAction::Off),
            "cy" => Ok(PowerAction::Cycle),
            _ => Err(()),
        }
    }
}

/// One SNMP SET, then `delay_after` before the next step may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerStep {
    pub value: PowerValue,
    pub delay_after: Duration,
}

impl PowerStep {
    fn immediate(value: PowerValue) -> Self {
        Self { value, delay_after: Duration::ZERO }
    }
}

pub fn resolve(device: &DeviceDescriptor, action: PowerAction) -> Vec<PowerStep> {
    let values = &device.power_values;
    match (action, values.cycle) {
        (PowerAction::On, _) => vec![PowerStep::immediate(values.on)],
        (PowerAction::Off, _) => vec![PowerStep::immediate(values.off)],
        (PowerAction::Cycle, Some(native)) => vec![PowerStep::immediate(native)],
        (PowerAction::Cycle, None) => vec![
            PowerStep { value: values.off, delay_after: device.cycle_delay },
            PowerStep::immediate(values.on),
        ],
    }
}
