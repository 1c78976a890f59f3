/**
 * PDU GATEWAY - Service entry point
 *
 * ROLE: Loads the configuration, installs logging and wires the serial
 * listener, health-check scheduler, dispatcher and status reporter together.
 *
 * ARCHITECTURE: One tokio task per component, all sharing the command
 * buffer and the registry snapshot. SIGHUP rebuilds the registry in place.
 */

use anyhow::{Context, Result};
use pdu_gateway::config::{config_path, load_config};
use pdu_gateway::healthcheck::HealthScheduler;
use pdu_gateway::intake::Intake;
use pdu_gateway::logging::init_logging;
use pdu_gateway::serial::SerialListener;
use pdu_gateway::snmp::AgentClient;
use pdu_gateway::{
    CommandBuffer, DeviceRegistry, Dispatcher, GatewayStatus, RegistryHandle, RetryPolicy,
    SnmpExecutor,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let path = config_path();
    let cfg = load_config(&path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    init_logging(&cfg.logging).context("Failed to initialize logging")?;

    let registry = DeviceRegistry::from_config(&cfg).context("Invalid device configuration")?;
    let policy = RetryPolicy::from_conf(&cfg.snmp.retry).context("Invalid retry policy")?;
    let probe_period = cfg.healthcheck_interval().context("Invalid healthcheck frequency")?;

    info!(
        devices = registry.len(),
        serial = %cfg.serial.device.display(),
        config = %path.display(),
        "pdu gateway starting"
    );

    let registry = RegistryHandle::new(registry);
    let buffer = Arc::new(CommandBuffer::new(cfg.dispatch.capacity));
    let status = GatewayStatus::new();
    let intake = Intake::new(registry.clone(), Arc::clone(&buffer), status.clone());

    let agent = AgentClient::bind(policy.timeout).await.context("Failed to open SNMP socket")?;
    let executor = SnmpExecutor::new(agent, policy);
    let dispatcher = Dispatcher::new(Arc::clone(&buffer), registry.clone(), executor, status.clone());
    tokio::spawn(dispatcher.run());

    tokio::spawn(HealthScheduler::new(intake.clone(), probe_period).run());

    let listener = SerialListener::new(
        cfg.serial.device.clone(),
        Duration::from_secs(cfg.serial.reconnect_delay),
        intake,
    );
    tokio::spawn(listener.run());

    let _reporter = status.spawn_reporter(Arc::clone(&buffer), Duration::from_secs(cfg.status.report_interval));

    #[cfg(unix)]
    tokio::spawn(reload::on_hangup(path.clone(), registry.clone()));

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!(queued = buffer.len(), "pdu gateway shutting down");
    Ok(())
}

#[cfg(unix)]
mod reload {
    use pdu_gateway::registry::load_registry;
    use pdu_gateway::RegistryHandle;
    use std::path::PathBuf;
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{error, info};

    /// On failure the previous registry stays active
    pub async fn on_hangup(path: PathBuf, registry: RegistryHandle) {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "cannot install SIGHUP handler, reload disabled");
                return;
            }
        };

        while hangup.recv().await.is_some() {
            match load_registry(&path).await {
                Ok(next) => {
                    let devices = next.len();
                    registry.replace(next);
                    info!(devices, config = %path.display(), "configuration reloaded");
                }
                Err(e) => error!(error = %e, "reload failed, keeping previous configuration"),
            }
        }
    }
}
