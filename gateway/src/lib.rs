//! RS-232 to SNMP gateway for switched PDU outlets.
//!
//! Serial lines become [`command::CommandRequest`]s, the [`buffer`] orders
//! them (health probes first), and a single [`dispatcher`] task turns each
//! one into SNMP exchanges, so at most one request is ever on the wire.

pub mod buffer;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod healthcheck;
pub mod intake;
pub mod logging;
pub mod power;
pub mod registry;
pub mod serial;
pub mod snmp;
pub mod state;
pub mod status;

pub use buffer::CommandBuffer;
pub use command::{Action, Command, CommandClass, CommandRequest};
pub use dispatcher::Dispatcher;
pub use error::{BufferFull, ConfigError, GatewayError};
pub use registry::{DeviceDescriptor, DeviceRegistry, RegistryHandle};
pub use snmp::{RetryPolicy, SnmpExecutor, SnmpTransport};
pub use status::GatewayStatus;
