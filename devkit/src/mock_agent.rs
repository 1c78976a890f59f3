/*!
Mock SNMP agent for dispatch tests

Stands in for a real PDU: records every exchange, plays back scripted
failures or hangs, and measures how many exchanges overlap.
*/

use parking_lot::Mutex;
use pdu_gateway::registry::{DeviceDescriptor, DeviceId};
use pdu_gateway::snmp::{SnmpError, SnmpOp, SnmpRequest, SnmpResponse, SnmpTransport};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Scripted outcome of the next exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(String),
    Fail(SnmpError),
    /// Never answers; the executor's timeout has to cut it off
    Hang,
}

/// One exchange as seen by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub device_id: DeviceId,
    pub oid: String,
    pub op: SnmpOp,
    pub at: Instant,
}

impl Exchange {
    pub fn is_get(&self) -> bool {
        self.op == SnmpOp::Get
    }
}

#[derive(Clone, Default)]
pub struct MockAgent {
    exchanges: Arc<Mutex<Vec<Exchange>>>,
    script: Arc<Mutex<VecDeque<Reply>>>,
    latency: Arc<Mutex<Duration>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    observer: Arc<Mutex<Option<mpsc::UnboundedSender<Exchange>>>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every exchange takes `latency` before replying
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Streams exchanges as they start
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<Exchange> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.observer.lock() = Some(sender);
        receiver
    }

    /// Queues replies; once the script runs out the agent answers normally
    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.script.lock().extend(replies);
    }

    pub fn hang_next(&self, count: usize) {
        self.script(std::iter::repeat(Reply::Hang).take(count));
    }

    pub fn fail_next(&self, count: usize, error: SnmpError) {
        self.script(std::iter::repeat(Reply::Fail(error)).take(count));
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.exchanges.lock().clone()
    }

    pub fn sets(&self) -> Vec<Exchange> {
        self.exchanges().into_iter().filter(|e| !e.is_get()).collect()
    }

    pub fn gets(&self) -> Vec<Exchange> {
        self.exchanges().into_iter().filter(Exchange::is_get).collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.exchanges.lock().clear();
        self.script.lock().clear();
    }
}

/// Decrements the in-flight gauge even when the exchange is cancelled
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SnmpTransport for MockAgent {
    async fn exchange(
        &self,
        device: &DeviceDescriptor,
        request: &SnmpRequest,
    ) -> Result<SnmpResponse, SnmpError> {
        let record = Exchange {
            device_id: device.id,
            oid: request.oid.clone(),
            op: request.op,
            at: Instant::now(),
        };
        self.exchanges.lock().push(record.clone());
        if let Some(sender) = self.observer.lock().as_ref() {
            let _ = sender.send(record);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let reply = self.script.lock().pop_front();
        match reply {
            Some(Reply::Value(value)) => Ok(SnmpResponse { oid: request.oid.clone(), value }),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Hang) => std::future::pending().await,
            None => {
                let value = match request.op {
                    SnmpOp::Get => "1".to_string(),
                    SnmpOp::Set(value) => value.to_string(),
                };
                Ok(SnmpResponse { oid: request.oid.clone(), value })
            }
        }
    }
}
