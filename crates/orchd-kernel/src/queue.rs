//! The pending-task queue: a min-heap under a runtime-chosen policy.
//!
//! `std::collections::BinaryHeap` orders by the element's `Ord`, so the
//! policy is stamped into every heap entry and the entry ordering *is* the
//! policy's total order (reversed, since the std heap is a max-heap).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use orchd_protocol::TimeStage;

use crate::task::TaggedTask;

/// How pending tasks are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// First come, first served: by arrival time.
    Fcfs,
    /// Shortest job first: by the client's expected duration.
    Sjf,
}

/// An unrecognized policy name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown scheduling policy {0:?} (expected \"fcfs\" or \"sjf\")")]
pub struct PolicyParseError(String);

impl FromStr for Policy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fcfs" => Ok(Policy::Fcfs),
            "sjf" => Ok(Policy::Sjf),
            other => Err(PolicyParseError(other.to_owned())),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Fcfs => f.write_str("fcfs"),
            Policy::Sjf => f.write_str("sjf"),
        }
    }
}

impl Policy {
    /// The policy's total order over tasks (smallest = served first).
    fn compare(&self, a: &TaggedTask, b: &TaggedTask) -> Ordering {
        match self {
            // Tasks lacking an arrival time compare equal; they do not
            // occur in steady state.
            Policy::Fcfs => match (a.time(TimeStage::Arrived), b.time(TimeStage::Arrived)) {
                (Some(ta), Some(tb)) => ta.cmp(&tb),
                _ => Ordering::Equal,
            },
            Policy::Sjf => a.expected_time().cmp(&b.expected_time()),
        }
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    policy: Policy,
    task: TaggedTask,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap pops its maximum, we want the minimum.
        self.policy.compare(&self.task, &other.task).reverse()
    }
}

/// Pending tasks, served in policy order.
///
/// Pushing moves the task in; popping moves it out. Iteration visits tasks
/// in arbitrary heap order — callers that need policy order pop.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    policy: Policy,
    heap: BinaryHeap<QueueEntry>,
}

impl TaskQueue {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            heap: BinaryHeap::new(),
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn push(&mut self, task: TaggedTask) {
        self.heap.push(QueueEntry {
            policy: self.policy,
            task,
        });
    }

    /// Remove and return the task the policy serves next.
    pub fn pop(&mut self) -> Option<TaggedTask> {
        self.heap.pop().map(|entry| entry.task)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// All pending tasks, in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &TaggedTask> {
        self.heap.iter().map(|entry| &entry.task)
    }
}
