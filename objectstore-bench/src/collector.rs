//! Collects operation records from all workers of a phase.
//!
//! Workers send their [`Operation`]s through an [`OperationSender`] into a bounded channel. A
//! single receiving task appends them to the log in arrival order. When the channel is full,
//! senders wait, so a slow collector throttles the workers instead of buffering without bound.
//!
//! The collector can also end a phase early with [`Collector::auto_term`] once the measured
//! throughput has stabilized.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::operation::{OpType, Operation, Operations};

/// Number of consecutive segments that must agree before a phase is terminated.
pub const AUTO_TERM_CHECK: usize = 7;
/// Multiple of the sample window that must have elapsed before a phase is terminated.
pub const AUTO_TERM_SAMPLES: usize = 25;

const CHANNEL_CAPACITY: usize = 1000;
const RECV_BATCH: usize = 64;
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A write handle into a [`Collector`].
#[derive(Clone, Debug)]
pub struct OperationSender {
    sender: mpsc::Sender<Operation>,
}

impl OperationSender {
    /// Appends an operation to the log, waiting while the collector is saturated.
    pub async fn send(&self, op: Operation) {
        if self.sender.send(op).await.is_err() {
            tracing::debug!("collector closed, dropping operation");
        }
    }
}

/// Accumulates the operations of a single phase.
#[derive(Debug)]
pub struct Collector {
    sender: mpsc::Sender<Operation>,
    ops: Arc<Mutex<Vec<Operation>>>,
    task: JoinHandle<()>,
    shutdown: DropGuard,
    monitor_token: CancellationToken,
}

impl Collector {
    /// Creates a collector and spawns its receiving task.
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let ops = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let ops = Arc::clone(&ops);
            async move {
                let mut batch = Vec::with_capacity(RECV_BATCH);
                while receiver.recv_many(&mut batch, RECV_BATCH).await > 0 {
                    ops.lock().unwrap().append(&mut batch);
                }
            }
        });

        let monitor_token = CancellationToken::new();
        Self {
            sender,
            ops,
            task,
            shutdown: monitor_token.clone().drop_guard(),
            monitor_token,
        }
    }

    /// Returns a new write handle.
    pub fn sender(&self) -> OperationSender {
        OperationSender {
            sender: self.sender.clone(),
        }
    }

    /// Returns a token that is cancelled once the throughput of `op_type` has stabilized.
    ///
    /// The returned token is a child of `parent` and is therefore also cancelled along with it.
    /// Once per second, a monitor splits the window in which all workers were active into
    /// segments of `min_duration / want_samples` and compares the newest segment against the
    /// `want_samples - 1` segments before it. If all of them are within `threshold` (a fraction
    /// of the newest segment's throughput) and the active window is longer than
    /// `min_duration * split_into / want_samples`, the token is cancelled.
    ///
    /// Throughput is measured in bytes per second, or in objects per second for operations that
    /// transfer no payload.
    pub fn auto_term(
        &self,
        parent: &CancellationToken,
        op_type: OpType,
        threshold: f64,
        want_samples: usize,
        split_into: usize,
        min_duration: Duration,
    ) -> CancellationToken {
        let token = parent.child_token();
        let check = StabilityCheck {
            threshold,
            want_samples,
            split_into,
            min_duration,
        };

        let ops = Arc::clone(&self.ops);
        let shutdown = self.monitor_token.clone();
        let terminate = token.clone();
        tokio::spawn(async move {
            let first_check = Instant::now() + CHECK_INTERVAL;
            let mut interval = tokio::time::interval_at(first_check, CHECK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = terminate.cancelled() => return,
                    _ = interval.tick() => {}
                }

                let filtered: Operations = {
                    let ops = ops.lock().unwrap();
                    ops.iter()
                        .filter(|op| op.op_type == op_type)
                        .cloned()
                        .collect()
                };

                if check.is_stable(&filtered) {
                    tracing::info!(
                        op = %op_type,
                        ops = filtered.len(),
                        "throughput stabilized, ending phase"
                    );
                    terminate.cancel();
                    return;
                }
            }
        });

        token
    }

    /// Stops accepting operations and returns the complete log.
    ///
    /// All senders must have been dropped for this to return. Auto-termination monitors are
    /// stopped.
    pub async fn close(self) -> Operations {
        drop(self.shutdown);
        drop(self.sender);

        if let Err(error) = self.task.await {
            tracing::error!(error = &error as &dyn std::error::Error, "collector task failed");
        }

        let ops = std::mem::take(&mut *self.ops.lock().unwrap());
        Operations::from(ops)
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters of the throughput stability check.
#[derive(Clone, Copy, Debug)]
struct StabilityCheck {
    threshold: f64,
    want_samples: usize,
    split_into: usize,
    min_duration: Duration,
}

impl StabilityCheck {
    fn is_stable(&self, ops: &Operations) -> bool {
        if self.want_samples == 0 {
            return false;
        }

        let Some((start, end)) = ops.active_time_range() else {
            return false;
        };
        let active = end.duration_since(start).unwrap_or_default();

        let required = self.min_duration.mul_f64(self.split_into as f64 / self.want_samples as f64);
        if active <= required {
            return false;
        }

        let segment = self.min_duration / self.want_samples as u32;
        let segments = throughput_segments(ops, start, end, segment);
        if segments.len() < self.want_samples {
            return false;
        }

        let Some((&newest, rest)) = segments.split_last() else {
            return false;
        };
        let previous = &rest[rest.len() + 1 - self.want_samples..];

        previous.iter().all(|&sample| {
            let (base, value) = if newest.bytes > 0.0 {
                (newest.bytes, sample.bytes)
            } else {
                (newest.objects, sample.objects)
            };
            (base - value).abs() <= self.threshold * base
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Throughput {
    bytes: f64,
    objects: f64,
}

/// Splits `[start, end)` into full segments and computes per-second throughput of each.
///
/// Operations are attributed to the segment in which they ended.
fn throughput_segments(
    ops: &Operations,
    start: SystemTime,
    end: SystemTime,
    segment: Duration,
) -> Vec<Throughput> {
    if segment.is_zero() {
        return Vec::new();
    }

    let span = end.duration_since(start).unwrap_or_default();
    let count = (span.as_nanos() / segment.as_nanos()) as usize;
    let mut totals = vec![Throughput::default(); count];

    for op in ops {
        let Ok(offset) = op.end.duration_since(start) else {
            continue;
        };
        let index = (offset.as_nanos() / segment.as_nanos()) as usize;
        if let Some(total) = totals.get_mut(index) {
            total.bytes += op.size as f64;
            total.objects += op.objects_per_op as f64;
        }
    }

    let secs = segment.as_secs_f64();
    for total in &mut totals {
        total.bytes /= secs;
        total.objects /= secs;
    }
    totals
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    fn stat_at(thread: u16, start_ms: u64, end_ms: u64) -> Operation {
        let mut op = Operation::new(OpType::Stat, thread, "key");
        op.start = UNIX_EPOCH + Duration::from_millis(start_ms);
        op.end = UNIX_EPOCH + Duration::from_millis(end_ms);
        op
    }

    /// One operation every `interval_ms` per thread, for `total_ms`.
    fn steady(threads: u16, interval_ms: u64, total_ms: u64) -> Vec<Operation> {
        let mut ops = Vec::new();
        for thread in 0..threads {
            let mut t = 0;
            while t + interval_ms <= total_ms {
                ops.push(stat_at(thread, t, t + interval_ms));
                t += interval_ms;
            }
        }
        ops
    }

    fn check() -> StabilityCheck {
        StabilityCheck {
            threshold: 0.1,
            want_samples: AUTO_TERM_CHECK,
            split_into: AUTO_TERM_SAMPLES,
            min_duration: Duration::from_millis(700),
        }
    }

    #[test]
    fn steady_throughput_is_stable() {
        let ops = Operations::from(steady(2, 10, 5_000));
        assert!(check().is_stable(&ops));
    }

    #[test]
    fn short_window_is_not_stable() {
        // The check needs more than 700ms * 25 / 7 = 2.5s of activity.
        let ops = Operations::from(steady(2, 10, 2_000));
        assert!(!check().is_stable(&ops));
    }

    #[test]
    fn changing_throughput_is_not_stable() {
        let mut ops = steady(1, 10, 5_000);
        // A burst at the very end doubles the rate of the newest segment.
        ops.extend((0..10).map(|i| stat_at(0, 4_950 + i, 4_951 + i)));
        assert!(!check().is_stable(&Operations::from(ops)));
    }

    #[test]
    fn segments_attribute_by_end_time() {
        let ops = Operations::from(vec![
            stat_at(0, 0, 50),
            stat_at(0, 50, 150),
            stat_at(0, 150, 199),
        ]);
        let start = UNIX_EPOCH;
        let end = UNIX_EPOCH + Duration::from_millis(200);
        let segments = throughput_segments(&ops, start, end, Duration::from_millis(100));

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].objects, 10.0);
        assert_eq!(segments[1].objects, 20.0);
    }

    #[tokio::test]
    async fn close_returns_all_operations_in_order() {
        let collector = Collector::new();
        let sender = collector.sender();
        for i in 0..2500 {
            sender.send(stat_at(0, i, i + 1)).await;
        }
        drop(sender);

        let ops = collector.close().await;
        assert_eq!(ops.len(), 2500);
        let starts: Vec<_> = ops.iter().map(|op| op.start).collect();
        assert!(starts.is_sorted());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_term_cancels_once_stable() {
        let collector = Collector::new();
        let sender = collector.sender();
        for op in steady(2, 10, 5_000) {
            sender.send(op).await;
        }

        let parent = CancellationToken::new();
        let token = collector.auto_term(
            &parent,
            OpType::Stat,
            0.1,
            AUTO_TERM_CHECK,
            AUTO_TERM_SAMPLES,
            Duration::from_millis(700),
        );

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        assert!(!parent.is_cancelled());

        drop(sender);
        collector.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn auto_term_follows_parent() {
        let collector = Collector::new();
        let parent = CancellationToken::new();
        let token = collector.auto_term(&parent, OpType::Put, 0.1, 7, 25, Duration::from_secs(1));

        assert!(!token.is_cancelled());
        parent.cancel();
        assert!(token.is_cancelled());
        collector.close().await;
    }
}
