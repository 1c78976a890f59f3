/**
 * COMMAND DISPATCHER - Single-flight consumer of the command buffer
 *
 * ROLE: Drains the buffer one command at a time, resolves targets against
 * the registry snapshot, runs the SNMP exchange and logs the outcome.
 *
 * ARCHITECTURE: Explicit Idle / Executing / Waiting state machine driven by
 * the tokio clock. Waiting is the pause inside a synthesized power cycle:
 * health probes may run during it, NORMAL commands may not.
 */

use crate::buffer::{CommandBuffer, QueuedCommand};
use crate::command::Action;
use crate::power::{self, PowerAction};
use crate::registry::{DeviceDescriptor, DeviceRegistry, PortId, RegistryHandle};
use crate::snmp::{SnmpExecutor, SnmpFailure, SnmpRequest, SnmpResponse, SnmpTransport};
use crate::status::{DispatchPhase, GatewayStatus};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
enum DispatchState {
    Idle,
    Executing(QueuedCommand),
    Waiting { resume_at: Instant, pending: QueuedCommand },
}

impl DispatchState {
    fn phase(&self) -> DispatchPhase {
        match self {
            DispatchState::Idle => DispatchPhase::Idle,
            DispatchState::Executing(_) => DispatchPhase::Executing,
            DispatchState::Waiting { .. } => DispatchPhase::Waiting,
        }
    }
}

pub struct Dispatcher<T> {
    buffer: Arc<CommandBuffer>,
    registry: RegistryHandle,
    executor: SnmpExecutor<T>,
    status: GatewayStatus,
}

impl<T: SnmpTransport> Dispatcher<T> {
    pub fn new(
        buffer: Arc<CommandBuffer>,
        registry: RegistryHandle,
        executor: SnmpExecutor<T>,
        status: GatewayStatus,
    ) -> Self {
        Self { buffer, registry, executor, status }
    }

    /// Runs until the task is dropped. Executor failures never end the loop.
    pub async fn run(self) {
        let mut state = DispatchState::Idle;
        loop {
            self.status.set_phase(state.phase());
            state = self.advance(state).await;
        }
    }

    async fn advance(&self, state: DispatchState) -> DispatchState {
        match state {
            DispatchState::Idle => DispatchState::Executing(self.buffer.next().await),
            DispatchState::Executing(entry) => self.execute(entry).await,
            DispatchState::Waiting { resume_at, pending } => {
                tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(resume_at) => {
                        self.buffer.resume(pending);
                        DispatchState::Idle
                    }
                    probe = self.buffer.next_healthcheck() => {
                        self.status.set_phase(DispatchPhase::Executing);
                        self.execute(probe).await;
                        DispatchState::Waiting { resume_at, pending }
                    }
                }
            }
        }
    }

    async fn execute(&self, entry: QueuedCommand) -> DispatchState {
        let registry = entry.pinned.clone().unwrap_or_else(|| self.registry.load());
        let command = entry.command;

        let device = match registry.resolve(command.device_id) {
            Ok(device) => device,
            Err(err) => {
                warn!(device = command.device_id, sequence = command.sequence, error = %err, "dropping command");
                return DispatchState::Idle;
            }
        };

        match command.action {
            Action::HealthCheck => {
                self.probe(device).await;
                DispatchState::Idle
            }
            Action::Power(action) => match command.port {
                Some(port) => self.switch(&registry, device, port, action, entry).await,
                None => {
                    warn!(device = command.device_id, sequence = command.sequence, "power command without port");
                    DispatchState::Idle
                }
            },
        }
    }

    async fn probe(&self, device: &DeviceDescriptor) {
        let outcome = self.exchange(device, &SnmpRequest::get(device.probe_oid())).await;
        self.status.record_probe(outcome.is_ok());
        match outcome {
            Ok(response) => info!(device = device.id, ok = true, value = %response.value, "probe_result"),
            Err(failure) => warn!(
                device = device.id,
                ok = false,
                attempts = failure.attempts,
                cause = %failure.last_cause,
                "probe_result"
            ),
        }
    }

    async fn switch(
        &self,
        registry: &Arc<DeviceRegistry>,
        device: &DeviceDescriptor,
        port: PortId,
        action: PowerAction,
        entry: QueuedCommand,
    ) -> DispatchState {
        let command = entry.command;
        let oid = match device.lookup_oid(port) {
            Ok(oid) => oid,
            Err(err) => {
                warn!(device = device.id, port, sequence = command.sequence, error = %err, "dropping command");
                return DispatchState::Idle;
            }
        };

        let steps = power::resolve(device, action);
        let Some(step) = steps.get(entry.step).copied() else {
            return DispatchState::Idle;
        };

        let outcome = self.exchange(device, &SnmpRequest::set(oid, step.value)).await;
        let failed = entry.failed || outcome.is_err();
        match outcome {
            Ok(_) => info!(
                device = device.id,
                port,
                action = %action,
                step = entry.step + 1,
                steps = steps.len(),
                ok = true,
                "command_result"
            ),
            Err(failure) => warn!(
                device = device.id,
                port,
                action = %action,
                step = entry.step + 1,
                steps = steps.len(),
                ok = false,
                attempts = failure.attempts,
                cause = %failure.last_cause,
                "command_result"
            ),
        }

        // The remaining steps run even if this one failed.
        if entry.step + 1 < steps.len() {
            DispatchState::Waiting {
                resume_at: Instant::now() + step.delay_after,
                pending: QueuedCommand {
                    command,
                    step: entry.step + 1,
                    pinned: Some(Arc::clone(registry)),
                    failed,
                },
            }
        } else {
            // one count per command, failed if any of its steps failed
            self.status.record_command(!failed);
            DispatchState::Idle
        }
    }

    async fn exchange(
        &self,
        device: &DeviceDescriptor,
        request: &SnmpRequest,
    ) -> Result<SnmpResponse, SnmpFailure> {
        self.status.begin_exchange();
        let outcome = self.executor.execute(device, request).await;
        self.status.end_exchange();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRequest;
    use crate::config::parse_config;
    use crate::registry::PowerValue;
    use crate::snmp::{RetryPolicy, SnmpError, SnmpOp};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(String, SnmpOp, Instant)>>>,
    }

    impl SnmpTransport for Recorder {
        async fn exchange(
            &self,
            device: &DeviceDescriptor,
            request: &SnmpRequest,
        ) -> Result<SnmpResponse, SnmpError> {
            self.seen.lock().push((device.transport.to_string(), request.op, Instant::now()));
            Ok(SnmpResponse { oid: request.oid.clone(), value: "1".into() })
        }
    }

    fn registry(ip: &str) -> DeviceRegistry {
        let text = format!(
            r#"
serial: {{ device: /dev/null }}
snmp: {{ retry: {{ max_attempts: 1, delay: 0, timeout: 1 }} }}
healthcheck: {{ frequency: 5 }}
power_states: {{ cy_delay: 5 }}
devices:
  1:
    snmp:
      ip_address: {ip}
      v2: {{ public_community: public, private_community: private }}
    outlets: {{ 1: 1.3.6.1.4.1.850.1.1 }}
    power_states: {{ on: 2, of: 1 }}
"#
        );
        DeviceRegistry::from_config(&parse_config(&text, "test").unwrap()).unwrap()
    }

    fn dispatcher(handle: RegistryHandle, buffer: Arc<CommandBuffer>) -> (Dispatcher<Recorder>, Recorder) {
        let recorder = Recorder::default();
        let view = Recorder { seen: Arc::clone(&recorder.seen) };
        let policy = RetryPolicy { max_attempts: 1, delay: Duration::ZERO, timeout: Duration::from_secs(1) };
        let executor = SnmpExecutor::new(recorder, policy);
        (Dispatcher::new(buffer, handle, executor, GatewayStatus::new()), view)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_is_dropped_and_loop_continues() {
        let buffer = Arc::new(CommandBuffer::new(None));
        let handle = RegistryHandle::new(registry("10.0.0.1"));
        let (dispatcher, view) = dispatcher(handle, Arc::clone(&buffer));

        buffer.submit(CommandRequest::power(9, 1, PowerAction::On)).unwrap();
        buffer.submit(CommandRequest::power(1, 1, PowerAction::On)).unwrap();
        let task = tokio::spawn(dispatcher.run());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let seen = view.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, SnmpOp::Set(PowerValue(2)));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_keeps_snapshot_across_reload() {
        let buffer = Arc::new(CommandBuffer::new(None));
        let handle = RegistryHandle::new(registry("10.0.0.1"));
        let (dispatcher, view) = dispatcher(handle.clone(), Arc::clone(&buffer));

        buffer.submit(CommandRequest::power(1, 1, PowerAction::Cycle)).unwrap();
        let task = tokio::spawn(dispatcher.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.replace(registry("10.0.0.2"));
        tokio::time::sleep(Duration::from_secs(10)).await;

        let seen = view.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, SnmpOp::Set(PowerValue(1)));
        assert_eq!(seen[1].1, SnmpOp::Set(PowerValue(2)));
        assert!(seen.iter().all(|(addr, _, _)| addr == "10.0.0.1:161"));
        assert!(seen[1].2 - seen[0].2 >= Duration::from_secs(5));
        task.abort();
    }
}
