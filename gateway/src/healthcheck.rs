//! Periodic health probes.
//!
//! Each tick queues one HEALTHCHECK per configured device and returns at
//! once; the cadence does not depend on how busy the dispatcher is.

use crate::intake::Intake;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

pub struct HealthScheduler {
    intake: Intake,
    period: Duration,
}

impl HealthScheduler {
    pub fn new(intake: Intake, period: Duration) -> Self {
        Self { intake, period }
    }

    /// Queues a probe for every device in the current snapshot
    pub fn tick(&self) -> usize {
        let registry = self.intake.registry().load();
        let queued = registry
            .device_ids()
            .into_iter()
            .filter(|id| self.intake.submit_probe(*id).is_ok())
            .count();
        debug!(queued, devices = registry.len(), "health probes queued");
        queued
    }

    /// First tick one period after start
    pub async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick();
        }
    }
}
