use crate::buffer::CommandBuffer;
use crate::command::{Command, CommandRequest};
use crate::error::GatewayError;
use crate::power::PowerAction;
use crate::registry::{DeviceId, PortId, RegistryHandle};
use crate::status::GatewayStatus;
use std::sync::Arc;
use tracing::{debug, warn};

/// Front door of the command buffer.
///
/// Power requests are checked against the current registry snapshot first;
/// anything that fails validation is logged here and never queued.
#[derive(Clone)]
pub struct Intake {
    registry: RegistryHandle,
    buffer: Arc<CommandBuffer>,
    status: GatewayStatus,
}

impl Intake {
    pub fn new(registry: RegistryHandle, buffer: Arc<CommandBuffer>, status: GatewayStatus) -> Self {
        Self { registry, buffer, status }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn submit_power(
        &self,
        device: DeviceId,
        port: PortId,
        action: PowerAction,
    ) -> Result<Command, GatewayError> {
        let result = self.validate(device, port).and_then(|()| {
            self.buffer
                .submit(CommandRequest::power(device, port, action))
                .map_err(GatewayError::from)
        });

        match &result {
            Ok(command) => {
                self.status.record_submitted();
                debug!(device, port, action = %action, sequence = command.sequence, "command queued");
            }
            Err(err) => {
                self.status.record_rejected();
                warn!(device, port, action = %action, error = %err, "command rejected");
            }
        }
        result
    }

    pub fn submit_probe(&self, device: DeviceId) -> Result<Command, GatewayError> {
        match self.buffer.submit(CommandRequest::healthcheck(device)) {
            Ok(command) => {
                self.status.record_submitted();
                Ok(command)
            }
            Err(full) => {
                self.status.record_rejected();
                warn!(device, error = %full, "probe rejected");
                Err(full.into())
            }
        }
    }

    fn validate(&self, device: DeviceId, port: PortId) -> Result<(), GatewayError> {
        let registry = self.registry.load();
        registry.resolve(device)?.lookup_oid(port)?;
        Ok(())
    }
}
