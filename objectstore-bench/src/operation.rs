//! Measurement records emitted by benchmark workers.
//!
//! Every completed call against the storage service produces exactly one [`Operation`]. The
//! records of a phase are accumulated by the [`Collector`](crate::collector::Collector) into an
//! [`Operations`] log, in the order in which they arrived.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

/// The kind of call an [`Operation`] measured.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    /// An upload of a full object.
    Put,
    /// A metadata lookup (`HEAD`) of an object.
    Stat,
    /// Removal of an object.
    Delete,
}

impl OpType {
    /// Returns the upper-case name used in logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Put => "PUT",
            OpType::Stat => "STAT",
            OpType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measured call against the storage service.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Operation {
    /// The kind of call.
    pub op_type: OpType,
    /// Index of the worker that performed the call.
    pub thread: u16,
    /// Bytes transferred or expected.
    pub size: u64,
    /// Key of the object the call acted upon.
    pub key: String,
    /// The server instance the call was sent to.
    pub endpoint: String,
    /// Wall clock time right before the call was issued.
    pub start: SystemTime,
    /// Wall clock time right after the call returned.
    pub end: SystemTime,
    /// A description of the failure, if the call did not produce a usable result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of logical objects touched by this call.
    pub objects_per_op: u32,
}

impl Operation {
    /// Creates a record for a call that has not been timed yet.
    pub fn new(op_type: OpType, thread: u16, key: impl Into<String>) -> Self {
        let now = SystemTime::now();
        Self {
            op_type,
            thread,
            size: 0,
            key: key.into(),
            endpoint: String::new(),
            start: now,
            end: now,
            error: None,
            objects_per_op: 1,
        }
    }

    /// Sets the transferred or expected size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the endpoint identity of the client that performs the call.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Marks the start of the call and returns a timer that completes the record.
    pub fn begin(&mut self) -> OpTimer {
        self.start = SystemTime::now();
        OpTimer {
            started: Instant::now(),
        }
    }

    /// Returns the duration of the call.
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }

    /// Returns `true` if the call failed.
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Measures the network call of an [`Operation`].
///
/// The end timestamp is derived from the monotonic clock, so a record completed with
/// [`finish`](Self::finish) never ends before it started, even if the wall clock jumps.
#[derive(Debug)]
#[must_use = "the operation is not timed until `finish` is called"]
pub struct OpTimer {
    started: Instant,
}

impl OpTimer {
    /// Sets the end timestamp of the operation.
    pub fn finish(self, op: &mut Operation) {
        op.end = op.start + self.started.elapsed();
    }
}

/// The log of operations collected during a phase, in arrival order.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Operations(Vec<Operation>);

impl Operations {
    /// Returns the number of recorded operations.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no operation was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the operations in arrival order.
    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.0.iter()
    }

    /// Returns a new log with only the operations of the given type.
    pub fn filter_type(&self, op_type: OpType) -> Operations {
        self.0
            .iter()
            .filter(|op| op.op_type == op_type)
            .cloned()
            .collect()
    }

    /// Returns all distinct operation types in the log.
    pub fn op_types(&self) -> Vec<OpType> {
        let mut types: Vec<_> = self.0.iter().map(|op| op.op_type).collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    /// Iterates over the failed operations.
    pub fn errors(&self) -> impl Iterator<Item = &Operation> {
        self.0.iter().filter(|op| op.is_err())
    }

    /// Sums up the size of all successful operations.
    pub fn total_bytes(&self) -> u64 {
        self.0
            .iter()
            .filter(|op| !op.is_err())
            .map(|op| op.size)
            .sum()
    }

    /// Returns the time range in which all threads were issuing operations.
    ///
    /// This is the range between the latest first start of any thread and the earliest last end
    /// of any thread. Returns `None` if the log is empty or the threads never overlapped.
    pub fn active_time_range(&self) -> Option<(SystemTime, SystemTime)> {
        let mut threads: BTreeMap<u16, (SystemTime, SystemTime)> = BTreeMap::new();
        for op in &self.0 {
            threads
                .entry(op.thread)
                .and_modify(|(first, last)| {
                    *first = (*first).min(op.start);
                    *last = (*last).max(op.end);
                })
                .or_insert((op.start, op.end));
        }

        let start = threads.values().map(|(first, _)| *first).max()?;
        let end = threads.values().map(|(_, last)| *last).min()?;
        (end > start).then_some((start, end))
    }

    /// Consumes the log and returns the raw records.
    pub fn into_inner(self) -> Vec<Operation> {
        self.0
    }
}

impl From<Vec<Operation>> for Operations {
    fn from(ops: Vec<Operation>) -> Self {
        Self(ops)
    }
}

impl FromIterator<Operation> for Operations {
    fn from_iter<T: IntoIterator<Item = Operation>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Operations {
    type Item = Operation;
    type IntoIter = std::vec::IntoIter<Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Operations {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_at(thread: u16, start_ms: u64, end_ms: u64) -> Operation {
        let mut op = Operation::new(OpType::Stat, thread, "key");
        op.start = SystemTime::UNIX_EPOCH + Duration::from_millis(start_ms);
        op.end = SystemTime::UNIX_EPOCH + Duration::from_millis(end_ms);
        op
    }

    #[test]
    fn timer_never_ends_before_start() {
        let mut op = Operation::new(OpType::Put, 0, "a/b");
        let timer = op.begin();
        timer.finish(&mut op);

        assert!(op.end >= op.start);
        assert!(!op.is_err());
    }

    #[test]
    fn active_time_range_spans_overlap_of_all_threads() {
        let ops: Operations = vec![
            op_at(0, 0, 10),
            op_at(1, 5, 15),
            op_at(0, 10, 40),
            op_at(1, 15, 30),
        ]
        .into();

        let (start, end) = ops.active_time_range().unwrap();
        assert_eq!(start, SystemTime::UNIX_EPOCH + Duration::from_millis(5));
        assert_eq!(end, SystemTime::UNIX_EPOCH + Duration::from_millis(30));
    }

    #[test]
    fn active_time_range_without_overlap() {
        let ops: Operations = vec![op_at(0, 0, 10), op_at(1, 20, 30)].into();
        assert_eq!(ops.active_time_range(), None);
        assert_eq!(Operations::default().active_time_range(), None);
    }

    #[test]
    fn errors_are_excluded_from_bytes() {
        let mut failed = op_at(0, 0, 1).with_size(100);
        failed.error = Some("boom".into());
        let ok = op_at(0, 1, 2).with_size(42);
        let ops: Operations = vec![failed, ok].into();

        assert_eq!(ops.total_bytes(), 42);
        assert_eq!(ops.errors().count(), 1);
    }

    #[test]
    fn serializes_op_type_upper_case() {
        let op = op_at(3, 0, 1);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op_type"], "STAT");
        assert!(json.get("error").is_none());

        let parsed: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, op);
    }
}
