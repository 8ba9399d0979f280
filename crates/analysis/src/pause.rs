//! Per-resource pause tokens shared by the scheduler and the continuous
//! per-resource analysis loop.
//!
//! Each resource has one owner slot (`0` = free). The executor acquires a
//! slot with a compare-and-swap `0 → id` before touching the resource and
//! releases it with `id → 0`. The continuous loop registers a
//! [`ContinuousLoopGate`] and asks it before every pass; a pass that sees a
//! non-zero owner backs off and acknowledges the pause.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use shopfloor_core::{ItemId, ResourceId, SchedulerConfig};

use crate::cancel::CancellationToken;
use crate::error::PauseError;

#[derive(Default)]
struct PauseSlot {
    owner: AtomicI64,
    /// Owner last observed by the continuous loop.
    acknowledged: AtomicI64,
    loop_registered: AtomicBool,
    in_pass: AtomicBool,
}

/// Keyed table of pause tokens.
pub struct PauseCoordinator {
    slots: RwLock<HashMap<ResourceId, Arc<PauseSlot>>>,
    poll_interval: Duration,
    report_interval: Duration,
}

impl Default for PauseCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(2))
    }
}

impl PauseCoordinator {
    pub fn new(poll_interval: Duration, report_interval: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            poll_interval,
            report_interval,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.pause_poll_interval(), config.pause_report_interval())
    }

    fn slot(&self, resource: ResourceId) -> Arc<PauseSlot> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&resource)
        {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(resource).or_default())
    }

    /// Acquire the pause of `resource` for item `id`. Idempotent for the owner.
    pub fn request_pause(&self, resource: ResourceId, id: ItemId) -> bool {
        debug_assert!(id != 0, "item id 0 means free");
        let slot = self.slot(resource);
        match slot
            .owner
            .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                debug!(resource, item_id = id, "pause acquired");
                true
            }
            Err(current) => current == id,
        }
    }

    /// Release the pause of `resource` held by `id`.
    pub fn release_pause(&self, resource: ResourceId, id: ItemId) -> Result<(), PauseError> {
        let slot = self.slot(resource);
        match slot
            .owner
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                let _ = slot
                    .acknowledged
                    .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
                debug!(resource, item_id = id, "pause released");
                Ok(())
            }
            Err(owner) => {
                error!(resource, owner, requester = id, "pause released by a non-owner");
                Err(PauseError::NotOwner {
                    resource,
                    owner,
                    requester: id,
                })
            }
        }
    }

    /// Whether `id` currently owns the pause of `resource`.
    pub fn is_paused(&self, resource: ResourceId, id: ItemId) -> bool {
        self.slot(resource).owner.load(Ordering::SeqCst) == id
    }

    pub fn pause_owner(&self, resource: ResourceId) -> Option<ItemId> {
        match self.slot(resource).owner.load(Ordering::SeqCst) {
            0 => None,
            owner => Some(owner),
        }
    }

    pub fn is_pause_requested(&self, resource: ResourceId) -> bool {
        self.pause_owner(resource).is_some()
    }

    /// Wait until `id` owns the pause and, when a continuous loop is
    /// registered for `resource`, until that loop is out of its pass.
    ///
    /// Returns `false` on deadline or cancellation.
    pub fn wait_pause(
        &self,
        resource: ResourceId,
        id: ItemId,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> bool {
        let slot = self.slot(resource);
        let started = Instant::now();
        let mut next_report = started + self.report_interval;
        loop {
            let owned = slot.owner.load(Ordering::SeqCst) == id;
            let observed = !slot.loop_registered.load(Ordering::SeqCst)
                || !slot.in_pass.load(Ordering::SeqCst)
                || slot.acknowledged.load(Ordering::SeqCst) == id;
            if owned && observed {
                return true;
            }
            if cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    resource,
                    item_id = id,
                    waited = ?now - started,
                    "pause not effective before the deadline"
                );
                return false;
            }
            if now >= next_report {
                info!(resource, item_id = id, waited = ?now - started, "waiting for pause");
                next_report = now + self.report_interval;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Register the continuous loop of `resource`.
    pub fn register_loop(self: &Arc<Self>, resource: ResourceId) -> ContinuousLoopGate {
        let slot = self.slot(resource);
        slot.loop_registered.store(true, Ordering::SeqCst);
        ContinuousLoopGate { resource, slot }
    }
}

/// Loop-side view of one resource's pause token.
pub struct ContinuousLoopGate {
    resource: ResourceId,
    slot: Arc<PauseSlot>,
}

/// Answer to [`ContinuousLoopGate::begin_pass`].
pub enum PassPermit<'a> {
    /// No pause: run the pass while holding the guard.
    Proceed(PassGuard<'a>),
    /// Paused by this item: back off.
    Paused(ItemId),
}

impl ContinuousLoopGate {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Check the pause before starting a pass.
    pub fn begin_pass(&self) -> PassPermit<'_> {
        // in_pass is published before owner is read; the executor publishes
        // owner before reading in_pass. One of the two sees the other.
        self.slot.in_pass.store(true, Ordering::SeqCst);
        let owner = self.slot.owner.load(Ordering::SeqCst);
        if owner != 0 {
            self.slot.in_pass.store(false, Ordering::SeqCst);
            self.slot.acknowledged.store(owner, Ordering::SeqCst);
            debug!(resource = self.resource, owner, "pass skipped, resource paused");
            return PassPermit::Paused(owner);
        }
        PassPermit::Proceed(PassGuard { gate: self })
    }
}

impl Drop for ContinuousLoopGate {
    fn drop(&mut self) {
        self.slot.loop_registered.store(false, Ordering::SeqCst);
        self.slot.in_pass.store(false, Ordering::SeqCst);
    }
}

/// Marks a running pass of the continuous loop. Ends the pass on drop.
pub struct PassGuard<'a> {
    gate: &'a ContinuousLoopGate,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.gate.slot.in_pass.store(false, Ordering::SeqCst);
    }
}
