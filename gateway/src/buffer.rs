/**
 * COMMAND BUFFER - Two-lane priority queue between producers and the dispatcher
 *
 * ROLE: Stamps each request with a sequence number and files it in its lane.
 * HEALTHCHECK lane always drains before NORMAL; each lane is FIFO.
 *
 * ARCHITECTURE: Many producers (serial listener, health-check timer), one
 * consumer (dispatcher). Submission takes a short parking_lot lock and never
 * waits; the consumer parks on a tokio `Notify`.
 */

use crate::command::{Command, CommandClass, CommandRequest};
use crate::error::BufferFull;
use crate::registry::DeviceRegistry;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Buffered command plus the power step it should run next.
///
/// A resumed command carries the registry snapshot its first step ran
/// against, so a reload mid-cycle cannot change its target, and whether an
/// earlier step already failed.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub command: Command,
    pub step: usize,
    pub pinned: Option<Arc<DeviceRegistry>>,
    pub failed: bool,
}

#[derive(Debug, Default)]
struct Lanes {
    healthcheck: VecDeque<QueuedCommand>,
    normal: VecDeque<QueuedCommand>,
    next_sequence: u64,
}

impl Lanes {
    fn pop(&mut self) -> Option<QueuedCommand> {
        self.healthcheck.pop_front().or_else(|| self.normal.pop_front())
    }

    fn len(&self) -> usize {
        self.healthcheck.len() + self.normal.len()
    }
}

#[derive(Debug)]
pub struct CommandBuffer {
    lanes: Mutex<Lanes>,
    capacity: Option<usize>,
    ready: Notify,
}

impl CommandBuffer {
    /// `capacity: None` means unbounded
    pub fn new(capacity: Option<usize>) -> Self {
        Self { lanes: Mutex::new(Lanes::default()), capacity, ready: Notify::new() }
    }

    /// Sequences and enqueues a request. Never blocks on the consumer.
    ///
    /// When bounded, NORMAL is refused as soon as the buffer as a whole is
    /// full; HEALTHCHECK only once its own lane alone reaches capacity.
    pub fn submit(&self, request: CommandRequest) -> Result<Command, BufferFull> {
        let class = request.action.class();
        let command = {
            let mut lanes = self.lanes.lock();
            if let Some(capacity) = self.capacity {
                let used = match class {
                    CommandClass::Normal => lanes.len(),
                    CommandClass::HealthCheck => lanes.healthcheck.len(),
                };
                if used >= capacity {
                    return Err(BufferFull { class });
                }
            }

            let command = Command::stamp(request, lanes.next_sequence);
            lanes.next_sequence += 1;
            let entry = QueuedCommand { command, step: 0, pinned: None, failed: false };
            match class {
                CommandClass::HealthCheck => lanes.healthcheck.push_back(entry),
                CommandClass::Normal => lanes.normal.push_back(entry),
            }
            command
        };
        self.ready.notify_one();
        Ok(command)
    }

    /// Puts a partially executed command back at the head of the NORMAL lane
    pub fn resume(&self, entry: QueuedCommand) {
        self.lanes.lock().normal.push_front(entry);
        self.ready.notify_one();
    }

    pub fn try_next(&self) -> Option<QueuedCommand> {
        self.lanes.lock().pop()
    }

    pub fn try_next_healthcheck(&self) -> Option<QueuedCommand> {
        self.lanes.lock().healthcheck.pop_front()
    }

    /// Waits for the next command in priority order
    pub async fn next(&self) -> QueuedCommand {
        loop {
            let notified = self.ready.notified();
            if let Some(entry) = self.try_next() {
                return entry;
            }
            notified.await;
        }
    }

    /// Waits for the next HEALTHCHECK command, leaving NORMAL entries queued
    pub async fn next_healthcheck(&self) -> QueuedCommand {
        loop {
            let notified = self.ready.notified();
            if let Some(entry) = self.try_next_healthcheck() {
                return entry;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Action;
    use crate::power::PowerAction;
    use std::time::Duration;

    fn on(device: u8, port: u8) -> CommandRequest {
        CommandRequest::power(device, port, PowerAction::On)
    }

    #[test]
    fn test_healthcheck_lane_first() {
        let buffer = CommandBuffer::new(None);
        buffer.submit(on(1, 1)).unwrap();
        buffer.submit(on(1, 2)).unwrap();
        buffer.submit(CommandRequest::healthcheck(1)).unwrap();

        let first = buffer.try_next().unwrap();
        assert_eq!(first.command.action, Action::HealthCheck);
        assert_eq!(first.command.sequence, 2);
        assert_eq!(buffer.try_next().unwrap().command.port, Some(1));
        assert_eq!(buffer.try_next().unwrap().command.port, Some(2));
        assert!(buffer.try_next().is_none());
    }

    #[test]
    fn test_fifo_within_class() {
        let buffer = CommandBuffer::new(None);
        for port in 0..10 {
            buffer.submit(on(1, port)).unwrap();
        }
        let seqs: Vec<u64> = std::iter::from_fn(|| buffer.try_next())
            .map(|e| e.command.sequence)
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_submit_unique_sequences() {
        let buffer = Arc::new(CommandBuffer::new(None));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for port in 0..50 {
                        buffer.submit(on(t, port)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seqs: Vec<u64> = std::iter::from_fn(|| buffer.try_next())
            .map(|e| e.command.sequence)
            .collect();
        let drained = seqs.clone();
        seqs.sort_unstable();
        assert_eq!(drained, seqs, "lane order must follow sequence");
        seqs.dedup();
        assert_eq!(seqs.len(), 400);
    }

    #[test]
    fn test_capacity_sheds_normal_first() {
        let buffer = CommandBuffer::new(Some(2));
        buffer.submit(on(1, 1)).unwrap();
        buffer.submit(CommandRequest::healthcheck(1)).unwrap();

        assert_eq!(buffer.submit(on(1, 2)), Err(BufferFull { class: CommandClass::Normal }));
        buffer.submit(CommandRequest::healthcheck(2)).unwrap();
        assert_eq!(
            buffer.submit(CommandRequest::healthcheck(3)),
            Err(BufferFull { class: CommandClass::HealthCheck })
        );
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_resume_goes_ahead_of_normal_but_behind_healthcheck() {
        let buffer = CommandBuffer::new(None);
        let cycle = buffer.submit(CommandRequest::power(1, 1, PowerAction::Cycle)).unwrap();
        let entry = buffer.try_next().unwrap();

        buffer.submit(on(1, 2)).unwrap();
        buffer.submit(CommandRequest::healthcheck(1)).unwrap();
        buffer.resume(QueuedCommand { step: 1, ..entry });

        assert_eq!(buffer.try_next().unwrap().command.action, Action::HealthCheck);
        let resumed = buffer.try_next().unwrap();
        assert_eq!(resumed.command, cycle);
        assert_eq!(resumed.step, 1);
        assert_eq!(buffer.try_next().unwrap().command.port, Some(2));
    }

    #[tokio::test]
    async fn test_next_wakes_on_submit() {
        let buffer = Arc::new(CommandBuffer::new(None));
        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.next().await })
        };
        tokio::task::yield_now().await;
        buffer.submit(on(4, 2)).unwrap();

        let entry = tokio::time::timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(entry.command.device_id, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_healthcheck_ignores_normal() {
        let buffer = CommandBuffer::new(None);
        buffer.submit(on(1, 1)).unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(1), buffer.next_healthcheck()).await;
        assert!(waited.is_err());
        assert_eq!(buffer.len(), 1);

        buffer.submit(CommandRequest::healthcheck(1)).unwrap();
        let entry = buffer.next_healthcheck().await;
        assert_eq!(entry.command.action, Action::HealthCheck);
    }
}
