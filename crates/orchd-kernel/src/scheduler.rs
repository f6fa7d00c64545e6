//! The dispatch engine: a fixed slot table fed by the pending queue.
//!
//! The scheduler is a single-owner cooperative object: every method is
//! called from the orchestrator's loop, never from the tasks it spawns.
//! Spawned tasks communicate only by sending `TASK_DONE` messages back
//! through the server FIFO; the orchestrator turns those into
//! [`mark_done`](Scheduler::mark_done) calls.
//!
//! The orchestrator owns two of these: the main scheduler (user policy and
//! capacity) for submitted pipelines, and a small FCFS status scheduler so
//! status traffic can never starve real work — status requests that do not
//! fit are refused outright, never queued.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;

use orchd_protocol::{MonoTime, PipePaths, TimeStage};

use crate::queue::{Policy, TaskQueue};
use crate::runner::{self, RunnerSpec};
use crate::task::{TaggedTask, TaskPayload};

/// Slot count of the status scheduler.
pub const STATUS_SLOTS: usize = 32;

/// Scheduler failures.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A scheduler needs at least one slot.
    #[error("scheduler needs at least one slot")]
    InvalidArgument,

    /// The slot index is out of bounds or the slot is vacant.
    #[error("slot {0} is out of range or vacant")]
    NoSuchSlot(usize),

    /// The spawned task died instead of completing; the slot was freed.
    #[error("task in slot {0} failed before completing")]
    TaskFailed(usize),
}

/// One occupied concurrency reservation.
#[derive(Debug)]
struct SlotEntry {
    task: TaggedTask,
    handle: JoinHandle<u8>,
}

/// Fixed-capacity dispatcher over the pending queue.
#[derive(Debug)]
pub struct Scheduler {
    queue: TaskQueue,
    slots: Vec<Option<SlotEntry>>,
    out_dir: PathBuf,
    paths: PipePaths,
}

impl Scheduler {
    pub fn new(
        policy: Policy,
        nslots: usize,
        out_dir: PathBuf,
        paths: PipePaths,
    ) -> Result<Self, SchedulerError> {
        if nslots == 0 {
            return Err(SchedulerError::InvalidArgument);
        }
        Ok(Self {
            queue: TaskQueue::new(policy),
            slots: (0..nslots).map(|_| None).collect(),
            out_dir,
            paths,
        })
    }

    pub fn policy(&self) -> Policy {
        self.queue.policy()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Queue a task for dispatch.
    pub fn add(&mut self, task: TaggedTask) {
        self.queue.push(task);
    }

    /// Whether a dispatch right now would place at least one task.
    pub fn can_schedule_now(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Move tasks from the queue into vacant slots until either runs out.
    ///
    /// Each placed task is stamped DISPATCHED and spawned: pipelines run
    /// the task runner, procedures run themselves. Returns how many tasks
    /// were launched.
    pub fn dispatch_possible(&mut self) -> usize {
        let mut dispatched = 0;

        while let Some(slot) = self.first_vacant() {
            let Some(mut task) = self.queue.pop() else { break };
            task.stamp(TimeStage::Dispatched);

            let handle = match task.payload() {
                TaskPayload::Pipeline(programs) => tokio::spawn(runner::run(RunnerSpec {
                    id: task.id(),
                    programs: programs.clone(),
                    slot,
                    out_dir: self.out_dir.clone(),
                    paths: self.paths.clone(),
                })),
                TaskPayload::Procedure(procedure) => {
                    let procedure = Arc::clone(procedure);
                    tokio::spawn(async move { procedure.run(slot).await })
                }
            };

            self.slots[slot] = Some(SlotEntry { task, handle });
            dispatched += 1;
        }

        dispatched
    }

    /// Reclaim `slot` after its completion notification arrived.
    ///
    /// Awaits the spawned task (the reap — by protocol it is already about
    /// to finish), stamps ENDED from the notification and COMPLETED from
    /// the local clock, vacates the slot, and hands the task out. A task
    /// that died instead of completing still frees the slot but yields
    /// [`SchedulerError::TaskFailed`].
    pub async fn mark_done(
        &mut self,
        slot: usize,
        time_ended: MonoTime,
    ) -> Result<TaggedTask, SchedulerError> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or(SchedulerError::NoSuchSlot(slot))?
            .take()
            .ok_or(SchedulerError::NoSuchSlot(slot))?;

        if let Err(e) = entry.handle.await {
            tracing::warn!(slot, task = entry.task.id(), "reaping task failed: {e}");
            return Err(SchedulerError::TaskFailed(slot));
        }

        let mut task = entry.task;
        task.set_time(TimeStage::Ended, time_ended);
        task.stamp(TimeStage::Completed);
        Ok(task)
    }

    /// Tasks currently occupying slots.
    pub fn running(&self) -> impl Iterator<Item = &TaggedTask> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|entry| &entry.task))
    }

    /// Tasks still waiting in the queue, in arbitrary order.
    pub fn queued(&self) -> impl Iterator<Item = &TaggedTask> {
        self.queue.iter()
    }

    pub fn running_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    fn first_vacant(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }
}

// Dropping the scheduler drops the join handles, detaching any tasks that
// are still running; their completion notifications go unanswered, which
// only happens on server shutdown.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use crate::task::Procedure;

    use super::*;

    /// Procedure that records that it ran, then blocks until released.
    ///
    /// Releases are permits, so releasing before the task starts cannot be
    /// lost; each task consumes its permit for good.
    struct Gate {
        runs: AtomicUsize,
        permits: Semaphore,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                permits: Semaphore::new(0),
            })
        }

        fn release(&self, n: usize) {
            self.permits.add_permits(n);
        }
    }

    #[async_trait]
    impl Procedure for Gate {
        async fn run(&self, _slot: usize) -> u8 {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
            0
        }
    }

    fn scheduler(policy: Policy, nslots: usize) -> Scheduler {
        let dir = std::env::temp_dir();
        Scheduler::new(policy, nslots, dir.clone(), PipePaths::in_dir(dir)).unwrap()
    }

    fn gated_task(gate: &Arc<Gate>, id: u32, expected: u32) -> TaggedTask {
        let mut task =
            TaggedTask::from_procedure(Arc::clone(gate) as Arc<dyn Procedure>, id, expected);
        task.stamp(TimeStage::Arrived);
        task
    }

    #[test]
    fn zero_slots_is_invalid() {
        let dir = std::env::temp_dir();
        assert!(matches!(
            Scheduler::new(Policy::Fcfs, 0, dir.clone(), PipePaths::in_dir(dir)),
            Err(SchedulerError::InvalidArgument)
        ));
    }

    #[tokio::test]
    async fn dispatch_fills_slots_and_leaves_the_rest_queued() {
        let mut sched = scheduler(Policy::Fcfs, 2);
        let gate = Gate::new();
        for id in 1..=5 {
            sched.add(gated_task(&gate, id, 10));
        }

        assert_eq!(sched.dispatch_possible(), 2);
        assert_eq!(sched.running_count(), 2);
        assert_eq!(sched.queued_count(), 3);
        assert!(!sched.can_schedule_now());

        // Nothing more fits until a slot frees up.
        assert_eq!(sched.dispatch_possible(), 0);
    }

    #[tokio::test]
    async fn dispatched_tasks_actually_run() {
        let mut sched = scheduler(Policy::Fcfs, 4);
        let gate = Gate::new();
        sched.add(gated_task(&gate, 1, 10));
        sched.dispatch_possible();

        tokio::time::timeout(Duration::from_secs(1), async {
            while gate.runs.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dispatched procedure never ran");
    }

    #[tokio::test]
    async fn mark_done_returns_the_task_with_final_times() {
        let mut sched = scheduler(Policy::Fcfs, 1);
        let gate = Gate::new();
        sched.add(gated_task(&gate, 9, 10));
        sched.dispatch_possible();

        gate.release(1);
        let task = sched.mark_done(0, MonoTime::now()).await.unwrap();
        assert_eq!(task.id(), 9);
        assert!(task.time(TimeStage::Dispatched).is_some());
        assert!(task.time(TimeStage::Ended).is_some());
        assert!(task.time(TimeStage::Completed).is_some());
        assert!(sched.can_schedule_now());
        assert_eq!(sched.running_count(), 0);
    }

    #[tokio::test]
    async fn completion_frees_the_slot_for_the_next_task() {
        let mut sched = scheduler(Policy::Fcfs, 1);
        let gate = Gate::new();
        sched.add(gated_task(&gate, 1, 10));
        sched.add(gated_task(&gate, 2, 10));

        assert_eq!(sched.dispatch_possible(), 1);
        gate.release(1);
        sched.mark_done(0, MonoTime::now()).await.unwrap();

        assert_eq!(sched.dispatch_possible(), 1);
        let running: Vec<u32> = sched.running().map(|t| t.id()).collect();
        assert_eq!(running, vec![2]);
    }

    #[tokio::test]
    async fn mark_done_on_vacant_or_out_of_range_slot_is_an_error() {
        let mut sched = scheduler(Policy::Fcfs, 2);
        assert!(matches!(
            sched.mark_done(0, MonoTime::now()).await,
            Err(SchedulerError::NoSuchSlot(0))
        ));
        assert!(matches!(
            sched.mark_done(17, MonoTime::now()).await,
            Err(SchedulerError::NoSuchSlot(17))
        ));
    }

    #[tokio::test]
    async fn sjf_dispatches_shortest_first_once_a_slot_frees() {
        let mut sched = scheduler(Policy::Sjf, 1);
        let gate = Gate::new();
        sched.add(gated_task(&gate, 1, 1));
        sched.dispatch_possible();
        // Queue up out of order while the slot is held.
        sched.add(gated_task(&gate, 2, 90));
        sched.add(gated_task(&gate, 3, 30));
        sched.add(gated_task(&gate, 4, 60));

        gate.release(1);
        sched.mark_done(0, MonoTime::now()).await.unwrap();
        sched.dispatch_possible();

        let running: Vec<u32> = sched.running().map(|t| t.id()).collect();
        assert_eq!(running, vec![3]);
    }

    #[tokio::test]
    async fn iterators_split_running_from_queued() {
        let mut sched = scheduler(Policy::Fcfs, 1);
        let gate = Gate::new();
        sched.add(gated_task(&gate, 1, 10));
        sched.add(gated_task(&gate, 2, 10));
        sched.dispatch_possible();

        let running: Vec<u32> = sched.running().map(|t| t.id()).collect();
        let queued: Vec<u32> = sched.queued().map(|t| t.id()).collect();
        assert_eq!(running, vec![1]);
        assert_eq!(queued, vec![2]);
    }
}
