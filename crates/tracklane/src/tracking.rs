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

//! Authoritative tracking service.
//!
//! [`TrackingService`] owns the [`DeliveryTrackingRecord`]s and applies the
//! request contracts clients send through a transport. Every mutation runs in
//! two phases:
//!
//! 1. Under the table mutex: replay check, terminal/activity check, transition
//!    guard, optimistic version check, then acquisition of the record's
//!    operation lock. Any failure returns without side effects.
//! 2. After the (optional, simulated) apply latency: the lock is re-verified,
//!    the mutation applied, the version bumped and the lock released.
//!
//! Because the record stays locked between the phases, a second operation
//! arriving in the meantime observes `OPERATION_IN_PROGRESS`.

use crate::clock::Clock;
use crate::config::TrackingConfig;
use crate::error::{ApiError, ApiErrorCode};
use crate::lock::{EntityLock, LockOutcome};
use crate::models::delivery::{DeliveryStatus, DeliveryTrackingRecord, GeoPoint, LocationSample};
use crate::transition::{Actor, TransitionGuard};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How many applied operation ids each record remembers for replay detection.
const APPLIED_OPERATIONS_RETAINED: usize = 64;

/// Request to move a delivery to a new status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub operation_id: String,
    pub status: DeliveryStatus,
    pub notes: Option<String>,
    pub location: Option<LocationSample>,
    /// Optimistic concurrency check against the record's version
    pub expected_version: Option<u64>,
    /// Courier issuing the request, checked against the assignment
    pub courier_id: Option<String>,
}

/// Request to record a courier position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdateRequest {
    pub operation_id: String,
    pub sample: LocationSample,
    pub courier_id: Option<String>,
}

/// Request to mark a delivery as delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub operation_id: String,
    pub notes: Option<String>,
    pub location: Option<LocationSample>,
    pub expected_version: Option<u64>,
    pub courier_id: Option<String>,
}

/// A status change, emitted to the notification sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChange {
    pub entity_id: String,
    pub order_id: String,
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
    pub version: u64,
}

/// Mirrors delivery progress into the order entity.
pub trait OrderStatusSink: Send + Sync {
    fn mirror_status(&self, order_id: &str, status: DeliveryStatus) -> Result<(), ApiError>;
}

/// Fire-and-forget notification channel.
///
/// Implementations must not block; the service neither waits for nor checks
/// delivery.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, change: &StatusChange);
}

/// Order sink that only logs.
#[derive(Debug, Default)]
pub struct LoggingOrderSink;

impl OrderStatusSink for LoggingOrderSink {
    fn mirror_status(&self, order_id: &str, status: DeliveryStatus) -> Result<(), ApiError> {
        info!(order_id, %status, "Order status mirrored");
        Ok(())
    }
}

/// Notification sink that only logs.
#[derive(Debug, Default)]
pub struct LoggingNotificationSink;

impl NotificationSink for LoggingNotificationSink {
    fn notify(&self, change: &StatusChange) {
        debug!(
            entity_id = %change.entity_id,
            from = %change.from,
            to = %change.to,
            "Delivery status notification"
        );
    }
}

struct Entry {
    record: DeliveryTrackingRecord,
    applied: VecDeque<String>,
}

impl Entry {
    fn has_applied(&self, operation_id: &str) -> bool {
        self.applied.iter().any(|id| id == operation_id)
    }

    fn remember(&mut self, operation_id: &str) {
        if self.applied.len() == APPLIED_OPERATIONS_RETAINED {
            self.applied.pop_front();
        }
        self.applied.push_back(operation_id.to_string());
    }
}

enum Mutation {
    Status {
        target: DeliveryStatus,
        location: Option<LocationSample>,
        actor: Actor,
    },
    Location(LocationSample),
}

enum Admission {
    /// The operation id was applied before; nothing to do
    Replay(DeliveryTrackingRecord),
    Locked,
}

/// The authoritative owner of delivery records.
pub struct TrackingService {
    records: Mutex<HashMap<String, Entry>>,
    lock: EntityLock,
    guard: TransitionGuard,
    clock: Arc<dyn Clock>,
    history_capacity: usize,
    apply_latency: Duration,
    orders: Arc<dyn OrderStatusSink>,
    notifications: Arc<dyn NotificationSink>,
}

impl std::fmt::Debug for TrackingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingService")
            .field("records", &self.records.lock().len())
            .field("apply_latency", &self.apply_latency)
            .finish()
    }
}

impl TrackingService {
    pub fn new(config: &TrackingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            lock: EntityLock::new(config.lock_ttl(), clock.clone()),
            guard: TransitionGuard::new(config.arrival_threshold_m()),
            clock,
            history_capacity: config.history_capacity(),
            apply_latency: Duration::ZERO,
            orders: Arc::new(LoggingOrderSink),
            notifications: Arc::new(LoggingNotificationSink),
        }
    }

    /// Delays the apply step of every mutation, widening the window in which
    /// a concurrent operation observes the record as locked.
    pub fn with_apply_latency(mut self, latency: Duration) -> Self {
        self.apply_latency = latency;
        self
    }

    pub fn with_order_sink(mut self, sink: Arc<dyn OrderStatusSink>) -> Self {
        self.orders = sink;
        self
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = sink;
        self
    }

    /// Creates a delivery in `assigned` status.
    pub fn create_delivery(
        &self,
        id: &str,
        order_id: &str,
        pickup_location: GeoPoint,
        delivery_location: GeoPoint,
    ) -> Result<DeliveryTrackingRecord, ApiError> {
        if order_id.is_empty() {
            return Err(ApiError::new(
                ApiErrorCode::OrderNotFound,
                "a delivery needs an order",
            ));
        }
        let mut records = self.records.lock();
        if records.contains_key(id) {
            return Err(ApiError::validation(format!("delivery {} already exists", id)));
        }
        let record = DeliveryTrackingRecord::new(
            id,
            order_id,
            pickup_location,
            delivery_location,
            self.history_capacity,
            self.clock.now(),
        );
        records.insert(
            id.to_string(),
            Entry {
                record: record.clone(),
                applied: VecDeque::new(),
            },
        );
        info!(entity_id = id, order_id, "Delivery created");
        Ok(record)
    }

    /// Assigns a courier. Re-assigning the same courier is accepted; a
    /// different courier is rejected.
    pub fn assign(
        &self,
        entity_id: &str,
        courier_id: &str,
    ) -> Result<DeliveryTrackingRecord, ApiError> {
        let mut records = self.records.lock();
        let entry = records
            .get_mut(entity_id)
            .ok_or_else(|| ApiError::not_found(entity_id))?;
        let record = &mut entry.record;

        match record.courier_id.as_deref() {
            Some(existing) if existing == courier_id => return Ok(record.clone()),
            Some(existing) => {
                return Err(ApiError::new(
                    ApiErrorCode::DeliveryAlreadyAssigned,
                    format!("delivery {} is assigned to {}", entity_id, existing),
                ))
            }
            None => {}
        }
        if record.status != DeliveryStatus::Assigned {
            return Err(ApiError::validation(format!(
                "delivery {} can no longer be assigned ({})",
                entity_id, record.status
            )));
        }
        record.courier_id = Some(courier_id.to_string());
        record.updated_at = self.clock.now();
        info!(entity_id, courier_id, "Courier assigned");
        Ok(record.clone())
    }

    pub fn get(&self, entity_id: &str) -> Result<DeliveryTrackingRecord, ApiError> {
        self.records
            .lock()
            .get(entity_id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| ApiError::not_found(entity_id))
    }

    pub async fn update_status(
        &self,
        entity_id: &str,
        request: StatusUpdateRequest,
    ) -> Result<DeliveryTrackingRecord, ApiError> {
        let mutation = Mutation::Status {
            target: request.status,
            location: request.location,
            actor: Actor::Courier,
        };
        self.mutate(
            entity_id,
            &request.operation_id,
            request.courier_id.as_deref(),
            request.expected_version,
            mutation,
        )
        .await
    }

    pub async fn complete_delivery(
        &self,
        entity_id: &str,
        request: CompletionRequest,
    ) -> Result<DeliveryTrackingRecord, ApiError> {
        let mutation = Mutation::Status {
            target: DeliveryStatus::Delivered,
            location: request.location,
            actor: Actor::Courier,
        };
        self.mutate(
            entity_id,
            &request.operation_id,
            request.courier_id.as_deref(),
            request.expected_version,
            mutation,
        )
        .await
    }

    pub async fn update_location(
        &self,
        entity_id: &str,
        request: LocationUpdateRequest,
    ) -> Result<DeliveryTrackingRecord, ApiError> {
        self.mutate(
            entity_id,
            &request.operation_id,
            request.courier_id.as_deref(),
            None,
            Mutation::Location(request.sample),
        )
        .await
    }

    /// The merchant's hand-off confirmation: `at_pickup -> picked_up`.
    pub async fn confirm_pickup(
        &self,
        entity_id: &str,
        operation_id: &str,
    ) -> Result<DeliveryTrackingRecord, ApiError> {
        let record = self.get(entity_id)?;
        if record.status != DeliveryStatus::AtPickup {
            return Err(ApiError::invalid_transition(
                record.status,
                DeliveryStatus::PickedUp,
                TransitionGuard::allowed_transitions(record.status).to_vec(),
            ));
        }
        let mutation = Mutation::Status {
            target: DeliveryStatus::PickedUp,
            location: None,
            actor: Actor::Merchant,
        };
        self.mutate(entity_id, operation_id, None, None, mutation).await
    }

    async fn mutate(
        &self,
        entity_id: &str,
        operation_id: &str,
        courier_id: Option<&str>,
        expected_version: Option<u64>,
        mutation: Mutation,
    ) -> Result<DeliveryTrackingRecord, ApiError> {
        if let Admission::Replay(record) =
            self.admit(entity_id, operation_id, courier_id, expected_version, &mutation)?
        {
            debug!(entity_id, operation_id, "Replayed operation acknowledged");
            return Ok(record);
        }

        if !self.apply_latency.is_zero() {
            tokio::time::sleep(self.apply_latency).await;
        }

        self.apply(entity_id, operation_id, mutation)
    }

    fn admit(
        &self,
        entity_id: &str,
        operation_id: &str,
        courier_id: Option<&str>,
        expected_version: Option<u64>,
        mutation: &Mutation,
    ) -> Result<Admission, ApiError> {
        let mut records = self.records.lock();
        let entry = records
            .get_mut(entity_id)
            .ok_or_else(|| ApiError::not_found(entity_id))?;

        if entry.has_applied(operation_id) {
            return Ok(Admission::Replay(entry.record.clone()));
        }

        let record = &mut entry.record;
        if let (Some(assigned), Some(caller)) = (record.courier_id.as_deref(), courier_id) {
            if assigned != caller {
                return Err(ApiError::new(
                    ApiErrorCode::AccessDenied,
                    format!("courier {} is not assigned to delivery {}", caller, entity_id),
                ));
            }
        }

        match mutation {
            Mutation::Status {
                target,
                location,
                actor,
            } => {
                self.guard
                    .check(record, *target, location.as_ref(), *actor)
                    .map_err(|rejection| rejection.into_api_error(record.status, *target))?;
                if let Some(expected) = expected_version {
                    if expected != record.version {
                        return Err(ApiError::version_conflict(
                            entity_id,
                            expected,
                            record.version,
                        ));
                    }
                }
            }
            Mutation::Location(_) => {
                if !record.is_live || record.is_terminal() {
                    return Err(ApiError::not_active(entity_id));
                }
            }
        }

        match self.lock.acquire(&mut record.lock, entity_id, operation_id) {
            LockOutcome::Acquired { .. } => Ok(Admission::Locked),
            LockOutcome::Busy(busy) => Err(ApiError::operation_in_progress(
                entity_id,
                busy.held_by.as_deref(),
            )),
        }
    }

    fn apply(
        &self,
        entity_id: &str,
        operation_id: &str,
        mutation: Mutation,
    ) -> Result<DeliveryTrackingRecord, ApiError> {
        let mut records = self.records.lock();
        let entry = records
            .get_mut(entity_id)
            .ok_or_else(|| ApiError::not_found(entity_id))?;

        // A stale-lock reclaim during the apply window hands the record to
        // another operation; this one must not write.
        if !entry.record.lock.is_held()
            || entry.record.lock.last_operation_id.as_deref() != Some(operation_id)
        {
            warn!(entity_id, operation_id, "Lock lost before apply");
            return Err(ApiError::operation_in_progress(
                entity_id,
                entry.record.lock.last_operation_id.as_deref(),
            ));
        }

        let now = self.clock.now();
        let mut change = None;
        {
            let record = &mut entry.record;
            match mutation {
                Mutation::Status {
                    target, location, ..
                } => {
                    let from = record.status;
                    if let Some(sample) = location {
                        record.record_location(sample);
                    }
                    record.status = target;
                    record.version += 1;
                    if target.is_terminal() {
                        record.is_live = false;
                    }
                    change = Some(StatusChange {
                        entity_id: entity_id.to_string(),
                        order_id: record.order_id.clone(),
                        from,
                        to: target,
                        version: record.version,
                    });
                    info!(
                        entity_id,
                        operation_id,
                        %from,
                        to = %target,
                        version = record.version,
                        "Status applied"
                    );
                }
                Mutation::Location(sample) => {
                    record.record_location(sample);
                    debug!(entity_id, operation_id, "Location applied");
                }
            }
            record.updated_at = now;
            self.lock.release(&mut record.lock, entity_id, operation_id);
        }
        entry.remember(operation_id);
        let record = entry.record.clone();
        drop(records);

        if let Some(change) = change {
            if change.to == DeliveryStatus::Delivered {
                if let Err(e) = self.orders.mirror_status(&change.order_id, change.to) {
                    warn!(
                        entity_id,
                        order_id = %change.order_id,
                        error = %e,
                        "Failed to mirror order status"
                    );
                }
            }
            self.notifications.notify(&change);
        }
        Ok(record)
    }
}
