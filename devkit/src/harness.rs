/*!
Test harness for dispatch scenarios

Wires the real registry, buffer, intake and dispatcher around a `MockAgent`
from a YAML fixture. Meant to run under tokio's paused clock.
*/

use crate::mock_agent::{Exchange, MockAgent};
use anyhow::Result;
use pdu_gateway::command::Command;
use pdu_gateway::config::parse_config;
use pdu_gateway::error::GatewayError;
use pdu_gateway::healthcheck::HealthScheduler;
use pdu_gateway::intake::Intake;
use pdu_gateway::power::PowerAction;
use pdu_gateway::registry::DeviceId;
use pdu_gateway::status::DispatchPhase;
use pdu_gateway::{
    CommandBuffer, DeviceRegistry, Dispatcher, GatewayStatus, RegistryHandle, RetryPolicy,
    SnmpExecutor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const POLL: Duration = Duration::from_millis(10);

pub struct TestHarness {
    pub registry: RegistryHandle,
    pub buffer: Arc<CommandBuffer>,
    pub status: GatewayStatus,
    pub intake: Intake,
    pub agent: MockAgent,
    pub policy: RetryPolicy,
    probe_period: Duration,
    dispatcher: Option<JoinHandle<()>>,
}

impl TestHarness {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        init_tracing();

        let cfg = parse_config(yaml, "fixture")?;
        let registry = RegistryHandle::new(DeviceRegistry::from_config(&cfg)?);
        let policy = RetryPolicy::from_conf(&cfg.snmp.retry)?;
        let buffer = Arc::new(CommandBuffer::new(cfg.dispatch.capacity));
        let status = GatewayStatus::new();
        let intake = Intake::new(registry.clone(), Arc::clone(&buffer), status.clone());

        Ok(Self {
            registry,
            buffer,
            status,
            intake,
            agent: MockAgent::new(),
            policy,
            probe_period: cfg.healthcheck_interval()?,
            dispatcher: None,
        })
    }

    /// Swaps in a differently configured agent; call before `start`
    pub fn with_agent(mut self, agent: MockAgent) -> Self {
        self.agent = agent;
        self
    }

    /// Spawns the dispatcher loop against the mock agent
    pub fn start(&mut self) {
        if self.dispatcher.is_some() {
            return;
        }
        let executor = SnmpExecutor::new(self.agent.clone(), self.policy);
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.buffer),
            self.registry.clone(),
            executor,
            self.status.clone(),
        );
        self.dispatcher = Some(tokio::spawn(dispatcher.run()));
    }

    pub fn scheduler(&self) -> HealthScheduler {
        HealthScheduler::new(self.intake.clone(), self.probe_period)
    }

    pub fn submit_power(
        &self,
        device: DeviceId,
        port: u8,
        action: PowerAction,
    ) -> Result<Command, GatewayError> {
        self.intake.submit_power(device, port, action)
    }

    pub fn submit_probe(&self, device: DeviceId) -> Result<Command, GatewayError> {
        self.intake.submit_probe(device)
    }

    /// Polls until the agent has seen `count` exchanges
    pub async fn wait_for_exchanges(&self, count: usize, within: Duration) -> Result<Vec<Exchange>> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let seen = self.agent.exchanges();
            if seen.len() >= count {
                return Ok(seen);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("expected {count} exchanges within {within:?}, saw {}", seen.len());
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Polls until the buffer is drained and the dispatcher is idle
    pub async fn wait_idle(&self, within: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + within;
        while !(self.buffer.is_empty() && self.status.phase() == DispatchPhase::Idle) {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("dispatcher still busy after {within:?}");
            }
            tokio::time::sleep(POLL).await;
        }
        Ok(())
    }

    pub fn status_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.status.report(self.buffer.len()))?)
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.take() {
            task.abort();
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
