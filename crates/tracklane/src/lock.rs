/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Per-entity mutual exclusion with staleness reclaim.
//!
//! A [`LockSlot`] is the pair of fields a lockable record carries: the
//! acquisition timestamp and the id of the operation holding it. The
//! [`EntityLock`] policy decides whether a slot may be taken. A slot whose
//! age has reached the staleness TTL is presumed abandoned by a crashed or
//! timed-out holder and is reclaimed by the next operation.
//!
//! The service applies the policy to the slot embedded in each record. The
//! client keeps its own [`LockRegistry`] so one process never issues two
//! overlapping mutations for the same delivery.

use crate::clock::{to_chrono, Clock};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lock fields carried by a lockable record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockSlot {
    /// When the current holder acquired the lock; `None` when free
    pub operation_lock: Option<DateTime<Utc>>,
    /// The operation currently or most recently holding the lock
    pub last_operation_id: Option<String>,
}

impl LockSlot {
    pub fn is_held(&self) -> bool {
        self.operation_lock.is_some()
    }

    /// Age of the held lock at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.operation_lock.map(|at| now - at)
    }
}

/// A lock attempt that found the slot held by a live operation.
#[derive(Debug, Clone, PartialEq)]
pub struct LockBusy {
    pub held_by: Option<String>,
    pub age: Duration,
}

/// Result of [`EntityLock::acquire`].
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// The lock is now held. `reclaimed_from` names the stale holder, if any.
    Acquired { reclaimed_from: Option<String> },
    Busy(LockBusy),
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired { .. })
    }
}

/// The staleness-aware lock policy.
#[derive(Debug, Clone)]
pub struct EntityLock {
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl EntityLock {
    pub fn new(ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: to_chrono(ttl),
            clock,
        }
    }

    /// A held lock is stale once its age reaches the TTL.
    pub fn is_stale(&self, slot: &LockSlot) -> bool {
        slot.age(self.clock.now())
            .map_or(false, |age| age >= self.ttl)
    }

    /// Attempts to take `slot` for `operation_id`.
    ///
    /// Succeeds when the slot is free, already held by the same operation,
    /// or stale. A stale holder is overwritten and logged.
    pub fn acquire(&self, slot: &mut LockSlot, entity_id: &str, operation_id: &str) -> LockOutcome {
        let now = self.clock.now();
        let mut reclaimed_from = None;

        if let Some(age) = slot.age(now) {
            let same_holder = slot.last_operation_id.as_deref() == Some(operation_id);
            if !same_holder {
                if age < self.ttl {
                    debug!(
                        entity_id,
                        operation_id,
                        held_by = ?slot.last_operation_id,
                        age_ms = age.num_milliseconds(),
                        "Entity lock busy"
                    );
                    return LockOutcome::Busy(LockBusy {
                        held_by: slot.last_operation_id.clone(),
                        age,
                    });
                }
                warn!(
                    entity_id,
                    operation_id,
                    stale_holder = ?slot.last_operation_id,
                    age_ms = age.num_milliseconds(),
                    "Reclaiming stale entity lock"
                );
                reclaimed_from = slot.last_operation_id.clone();
            }
        }

        slot.operation_lock = Some(now);
        slot.last_operation_id = Some(operation_id.to_string());
        debug!(entity_id, operation_id, "Entity lock acquired");
        LockOutcome::Acquired { reclaimed_from }
    }

    /// Clears the lock only if `operation_id` still holds it.
    ///
    /// Returns false when a newer operation reclaimed the slot in the meantime,
    /// or when the slot was already free.
    pub fn release(&self, slot: &mut LockSlot, entity_id: &str, operation_id: &str) -> bool {
        if !slot.is_held() || slot.last_operation_id.as_deref() != Some(operation_id) {
            debug!(
                entity_id,
                operation_id,
                holder = ?slot.last_operation_id,
                "Ignoring release from non-holder"
            );
            return false;
        }
        slot.operation_lock = None;
        debug!(entity_id, operation_id, "Entity lock released");
        true
    }
}

/// Client-local lock table keyed by entity id.
#[derive(Debug, Clone)]
pub struct LockRegistry {
    policy: EntityLock,
    slots: Arc<Mutex<HashMap<String, LockSlot>>>,
}

impl LockRegistry {
    pub fn new(policy: EntityLock) -> Self {
        Self {
            policy,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Tries to lock `entity_id` for `operation_id`.
    ///
    /// The returned guard releases the lock when dropped.
    pub fn try_acquire(
        &self,
        entity_id: &str,
        operation_id: &str,
    ) -> Result<EntityLockGuard, LockBusy> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(entity_id.to_string()).or_default();
        match self.policy.acquire(slot, entity_id, operation_id) {
            LockOutcome::Acquired { .. } => Ok(EntityLockGuard {
                registry: self.clone(),
                entity_id: entity_id.to_string(),
                operation_id: operation_id.to_string(),
                held: true,
            }),
            LockOutcome::Busy(busy) => Err(busy),
        }
    }

    /// Unconditionally frees and forgets the slot for `entity_id`.
    pub fn clear(&self, entity_id: &str) {
        if self.slots.lock().remove(entity_id).is_some() {
            debug!(entity_id, "Entity lock cleared");
        }
    }

    pub fn slot(&self, entity_id: &str) -> Option<LockSlot> {
        self.slots.lock().get(entity_id).cloned()
    }

    fn release(&self, entity_id: &str, operation_id: &str) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(entity_id) {
            Some(slot) => self.policy.release(slot, entity_id, operation_id),
            None => false,
        }
    }
}

/// A held client-side entity lock.
///
/// Dropping the guard releases the lock. Release is holder-checked, so a
/// guard whose lock was reclaimed leaves the new holder untouched.
#[derive(Debug)]
pub struct EntityLockGuard {
    registry: LockRegistry,
    entity_id: String,
    operation_id: String,
    held: bool,
}

impl EntityLockGuard {
    /// Releases the lock early. Returns whether this guard still held it.
    pub fn release(&mut self) -> bool {
        if !self.held {
            return false;
        }
        self.held = false;
        self.registry.release(&self.entity_id, &self.operation_id)
    }
}

impl Drop for EntityLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}
