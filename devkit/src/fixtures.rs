/*!
Gateway configuration fixtures

Builds YAML in the same shape the service reads, so tests go through the
real config parser and registry construction.
*/

use std::fmt::Write;

pub const OUTLET_BASE: &str = "1.3.6.1.4.1.850.1.1.3.2.3.3.1.1.4.1";

pub fn outlet_oid(port: u8) -> String {
    format!("{OUTLET_BASE}.{port}")
}

#[derive(Debug, Clone)]
pub struct DeviceFixture {
    pub id: u8,
    pub ports: u8,
    pub native_cycle: Option<i32>,
    pub cy_delay: Option<u64>,
}

impl DeviceFixture {
    /// v2c device with outlets `1..=ports`, on=1 of=2
    pub fn new(id: u8, ports: u8) -> Self {
        Self { id, ports, native_cycle: None, cy_delay: None }
    }

    pub fn with_native_cycle(mut self, value: i32) -> Self {
        self.native_cycle = Some(value);
        self
    }

    pub fn with_cy_delay(mut self, seconds: u64) -> Self {
        self.cy_delay = Some(seconds);
        self
    }
}

#[derive(Debug, Clone)]
pub struct GatewayFixture {
    pub max_attempts: u32,
    pub delay: u64,
    pub timeout: u64,
    pub frequency: u64,
    pub cy_delay: u64,
    pub capacity: Option<usize>,
    pub devices: Vec<DeviceFixture>,
}

impl Default for GatewayFixture {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: 5,
            timeout: 5,
            frequency: 5,
            cy_delay: 5,
            capacity: None,
            devices: Vec::new(),
        }
    }
}

impl GatewayFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, max_attempts: u32, delay: u64, timeout: u64) -> Self {
        self.max_attempts = max_attempts;
        self.delay = delay;
        self.timeout = timeout;
        self
    }

    pub fn frequency(mut self, seconds: u64) -> Self {
        self.frequency = seconds;
        self
    }

    pub fn cy_delay(mut self, seconds: u64) -> Self {
        self.cy_delay = seconds;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn device(mut self, device: DeviceFixture) -> Self {
        self.devices.push(device);
        self
    }

    pub fn to_yaml(&self) -> String {
        let mut yaml = format!(
            "serial:\n  device: /dev/null\n\
             snmp:\n  retry: {{ max_attempts: {}, delay: {}, timeout: {} }}\n\
             healthcheck:\n  frequency: {}\n\
             power_states:\n  cy_delay: {}\n",
            self.max_attempts, self.delay, self.timeout, self.frequency, self.cy_delay
        );
        if let Some(capacity) = self.capacity {
            let _ = writeln!(yaml, "dispatch:\n  capacity: {capacity}");
        }

        yaml.push_str("devices:\n");
        for device in &self.devices {
            let _ = writeln!(yaml, "  \"{:03}\":", device.id);
            let _ = writeln!(
                yaml,
                "    snmp: {{ ip_address: 10.0.0.{}, v2: {{ public_community: public, private_community: private }} }}",
                device.id
            );
            yaml.push_str("    outlets:\n");
            for port in 1..=device.ports {
                let _ = writeln!(yaml, "      \"{port:03}\": {}", outlet_oid(port));
            }
            match device.native_cycle {
                Some(cy) => {
                    let _ = writeln!(yaml, "    power_states: {{ on: 1, of: 2, cy: {cy} }}");
                }
                None => yaml.push_str("    power_states: { on: 1, of: 2 }\n"),
            }
            if let Some(delay) = device.cy_delay {
                let _ = writeln!(yaml, "    cy_delay: {delay}");
            }
        }
        yaml
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdu_gateway::config::parse_config;
    use pdu_gateway::registry::{DeviceRegistry, PowerValue};
    use std::time::Duration;

    #[test]
    fn test_fixture_builds_valid_registry() {
        let yaml = GatewayFixture::new()
            .capacity(8)
            .device(DeviceFixture::new(1, 4))
            .device(DeviceFixture::new(2, 1).with_native_cycle(3).with_cy_delay(9))
            .to_yaml();
        let cfg = parse_config(&yaml, "fixture").unwrap();
        assert_eq!(cfg.dispatch.capacity, Some(8));

        let registry = DeviceRegistry::from_config(&cfg).unwrap();
        assert_eq!(registry.device_ids(), vec![1, 2]);
        assert_eq!(registry.resolve(1).unwrap().lookup_oid(4).unwrap(), outlet_oid(4));

        let second = registry.resolve(2).unwrap();
        assert_eq!(second.power_values.cycle, Some(PowerValue(3)));
        assert_eq!(second.cycle_delay, Duration::from_secs(9));
    }
}
