/*!
# PDU DevKit - test doubles for the gateway

- `MockAgent`: in-memory SNMP agent implementing `SnmpTransport`
- `GatewayFixture`: builds gateway YAML configurations
- `TestHarness`: registry + buffer + dispatcher wired around a `MockAgent`
*/

pub mod fixtures;
pub mod harness;
pub mod mock_agent;

pub use fixtures::{outlet_oid, DeviceFixture, GatewayFixture};
pub use harness::TestHarness;
pub use mock_agent::{Exchange, MockAgent, Reply};
