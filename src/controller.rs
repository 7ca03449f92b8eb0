//! Reconcile loop
//!
//! Holds a de-duplicating work queue of node groups and rollouts and feeds
//! them to their reconcilers. A rollout pass may change what a node group
//! shows, so every rollout pass queues the node groups again.

use crate::error::Result;
use crate::fleet::Fleet;
use crate::guard::GuardManager;
use crate::inventory::FleetInventory;
use crate::job::JobRunner;
use crate::nodegroup::NodeGroupReconciler;
use crate::rollout::RolloutReconciler;
use crate::store::RecordStore;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What a reconcile pass asks for next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until something changes
    Done,
    /// Run again after the given delay
    RequeueAfter(Duration),
}

/// A queued object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectRef {
    NodeGroup(String),
    Rollout(String),
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::NodeGroup(name) => write!(f, "NodeGroup/{}", name),
            ObjectRef::Rollout(name) => write!(f, "Rollout/{}", name),
        }
    }
}

/// Work queue holding each object at most once, at its earliest due time
#[derive(Debug, Default)]
pub struct WorkQueue {
    due: BTreeMap<ObjectRef, Instant>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `obj` at `at`, keeping an earlier due time if one is queued
    pub fn push(&mut self, obj: ObjectRef, at: Instant) {
        self.due
            .entry(obj)
            .and_modify(|t| {
                if at < *t {
                    *t = at;
                }
            })
            .or_insert(at);
    }

    /// Earliest queued object regardless of its due time
    pub fn pop(&mut self) -> Option<ObjectRef> {
        let obj = self
            .due
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(obj, _)| obj.clone())?;
        self.due.remove(&obj);
        Some(obj)
    }

    /// Earliest object due at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<ObjectRef> {
        match self.next_due() {
            Some(at) if at <= now => self.pop(),
            _ => None,
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.due.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}

/// Result of [`Controller::run_until_idle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleReport {
    pub passes: usize,
    /// Objects still queued when the pass budget ran out
    pub remaining: usize,
}

/// Drives both reconcilers over one fleet
pub struct Controller {
    fleet: Fleet,
    rollouts: RolloutReconciler,
    node_groups: NodeGroupReconciler,
    queue: WorkQueue,
}

impl Controller {
    /// Controller using the fleet's own secret-backed inventory
    pub fn new(fleet: Fleet, runner: Arc<dyn JobRunner>) -> Self {
        let inventory = fleet.inventory();
        Self::with_inventory(fleet, runner, inventory)
    }

    pub fn with_inventory(
        fleet: Fleet,
        runner: Arc<dyn JobRunner>,
        inventory: Arc<dyn FleetInventory>,
    ) -> Self {
        let guards = GuardManager::for_fleet(&fleet, inventory.clone());
        Self {
            rollouts: RolloutReconciler::new(fleet.clone(), runner, inventory),
            node_groups: NodeGroupReconciler::new(fleet.clone(), guards),
            fleet,
            queue: WorkQueue::new(),
        }
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn enqueue(&mut self, obj: ObjectRef) {
        self.queue.push(obj, Instant::now());
    }

    /// Queue every node group, then every rollout
    pub fn enqueue_all(&mut self) -> Result<()> {
        self.enqueue_node_groups()?;
        let now = Instant::now();
        for rollout in self.fleet.rollouts.list()? {
            self.queue.push(ObjectRef::Rollout(rollout.meta.name), now);
        }
        Ok(())
    }

    fn enqueue_node_groups(&mut self) -> Result<()> {
        let now = Instant::now();
        for group in self.fleet.node_groups.list()? {
            self.queue.push(ObjectRef::NodeGroup(group.meta.name), now);
        }
        Ok(())
    }

    /// Run one pass for `obj` and queue whatever it asks for
    pub fn process(&mut self, obj: ObjectRef) -> Result<()> {
        debug!("Reconciling {}", obj);
        let result = match &obj {
            ObjectRef::NodeGroup(name) => self.node_groups.reconcile(name),
            ObjectRef::Rollout(name) => self.rollouts.reconcile(name),
        };

        let delay = match result {
            Ok(Outcome::Done) => None,
            Ok(Outcome::RequeueAfter(delay)) => Some(delay),
            Err(e) if !e.is_transient() => {
                error!("Reconcile of {} failed, not retrying: {}", obj, e);
                None
            }
            Err(e) => {
                warn!(
                    "Reconcile of {} failed, retrying in {}s: {}",
                    obj, self.fleet.config.error_requeue_seconds, e
                );
                Some(self.fleet.config.error_requeue())
            }
        };
        if let Some(delay) = delay {
            self.queue.push(obj.clone(), Instant::now() + delay);
        }

        if matches!(obj, ObjectRef::Rollout(_)) {
            self.enqueue_node_groups()?;
        }
        Ok(())
    }

    /// Process queued objects without waiting for their due times until the
    /// queue drains or `max_passes` passes have run
    pub fn run_until_idle(&mut self, max_passes: usize) -> Result<IdleReport> {
        let mut passes = 0;
        while passes < max_passes {
            let Some(obj) = self.queue.pop() else {
                break;
            };
            self.process(obj)?;
            passes += 1;
        }
        let report = IdleReport {
            passes,
            remaining: self.queue.len(),
        };
        if report.remaining > 0 {
            warn!(
                "Stopped after {} passes with {} object(s) still queued",
                report.passes, report.remaining
            );
        } else {
            info!("Fleet idle after {} passes", report.passes);
        }
        Ok(report)
    }

    /// Reconcile continuously, with a full resync every `resync_seconds`,
    /// until `shutdown` resolves
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let resync = self.fleet.config.resync();
        let mut next_resync = Instant::now() + resync;
        self.enqueue_all()?;
        info!("Controller started, resync every {}s", resync.as_secs());

        loop {
            let wake = self
                .queue
                .next_due()
                .map(|at| at.min(next_resync))
                .unwrap_or(next_resync);

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
            }

            let now = Instant::now();
            if now >= next_resync {
                debug!("Periodic resync");
                self.enqueue_all()?;
                next_resync = now + resync;
            }
            while let Some(obj) = self.queue.pop_due(Instant::now()) {
                self.process(obj)?;
                tokio::task::yield_now().await;
            }
        }
    }
}
