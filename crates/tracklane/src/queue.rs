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

//! Durable, replay-safe operation queue.
//!
//! Every mutation a caller asks for is written to the pending-operation table
//! before anything is sent. [`OperationQueue::process_batch`] then takes up to
//! `batch_size` due operations for distinct deliveries, sends them
//! concurrently and settles each one independently:
//!
//! - success removes the operation and stores the returned record as the new
//!   local snapshot; a terminal record closes the delivery
//! - failure is classified, and recovery either requeues the operation at the
//!   head of the queue, resolves it as a no-op, or marks its error record
//!   `failed` and drops it
//!
//! Batches are spaced by a minimum interval. A call that arrives too early is
//! deferred: the queue schedules a wake-up on its drain trigger instead of
//! dropping the request.

use crate::clock::{to_chrono, Clock};
use crate::config::TrackingConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::dal::DAL;
use crate::error::{ApiError, QueueError, StoreError, TransportError};
use crate::lock::{EntityLock, LockRegistry};
use crate::models::delivery::{DeliveryStatus, DeliveryTrackingRecord};
use crate::models::error_record::{ErrorRecord, ErrorRecordStatus, ErrorType};
use crate::models::operation::{OperationPayload, OperationType, PendingOperation};
use crate::monitor::OperationMonitor;
use crate::recovery::{
    applicability, classify, signals_closed, Applicability, RecoveryDecision, RecoveryPolicy,
    RecoveryStrategies,
};
use crate::transport::{
    CompletionRequest, DeliveryTransport, LocationUpdateRequest, StatusUpdateRequest,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something that happened to a queued operation.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        operation_id: String,
        entity_id: String,
        operation_type: OperationType,
    },
    Succeeded {
        operation_id: String,
        entity_id: String,
        operation_type: OperationType,
        status: DeliveryStatus,
        version: u64,
    },
    RetryScheduled {
        operation_id: String,
        entity_id: String,
        error_type: ErrorType,
        retry_count: u32,
        delay: Duration,
    },
    /// The refreshed record showed the operation needs no further work
    ResolvedNoOp {
        operation_id: String,
        entity_id: String,
        error_type: ErrorType,
        outcome: Applicability,
    },
    /// Recovery gave up. Carries the user-facing message and suggested action.
    Failed {
        operation_id: String,
        entity_id: String,
        error_type: ErrorType,
        message: &'static str,
        suggested_action: &'static str,
        detail: String,
    },
    /// The delivery reached a terminal status and its queue was cleared
    EntityClosed {
        entity_id: String,
        status: DeliveryStatus,
        dropped: usize,
    },
}

/// Counts for one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Operations left untouched because the local store failed
    pub store_errors: usize,
}

/// What a call to [`OperationQueue::process_batch`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchReport {
    Processed(BatchSummary),
    /// Nothing was due
    Idle,
    /// Offline; nothing was attempted
    Paused,
    /// Another batch is in flight
    AlreadyRunning,
    /// Too soon after the previous batch; a drain is scheduled after `retry_in`
    Deferred { retry_in: Duration },
}

impl BatchReport {
    pub fn summary(&self) -> Option<BatchSummary> {
        match self {
            BatchReport::Processed(summary) => Some(*summary),
            _ => None,
        }
    }
}

enum Settled {
    Succeeded,
    Retried,
    Resolved,
    Failed,
}

/// Clears the in-flight flag when a batch ends, however it ends.
struct ProcessingToken<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ProcessingToken<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for ProcessingToken<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// The durable operation queue.
pub struct OperationQueue {
    dal: DAL,
    transport: Arc<dyn DeliveryTransport>,
    locks: LockRegistry,
    recovery: RecoveryStrategies,
    monitor: Arc<OperationMonitor>,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    min_flush_interval: Duration,
    courier_id: Option<String>,
    processing: AtomicBool,
    deferral_scheduled: Arc<AtomicBool>,
    last_batch_started: Mutex<Option<DateTime<Utc>>>,
    trigger: Arc<Notify>,
    events: broadcast::Sender<QueueEvent>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("database", &self.dal.database)
            .field("batch_size", &self.batch_size)
            .field("min_flush_interval", &self.min_flush_interval)
            .field("processing", &self.is_processing())
            .finish()
    }
}

impl OperationQueue {
    pub fn new(
        config: &TrackingConfig,
        dal: DAL,
        transport: Arc<dyn DeliveryTransport>,
        monitor: Arc<OperationMonitor>,
        connectivity: ConnectivityMonitor,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            dal,
            transport,
            locks: LockRegistry::new(EntityLock::new(config.lock_ttl(), clock.clone())),
            recovery: RecoveryStrategies::new(config.backoff_base(), config.backoff_cap()),
            monitor,
            connectivity,
            clock,
            batch_size: config.batch_size(),
            min_flush_interval: config.min_flush_interval(),
            courier_id: None,
            processing: AtomicBool::new(false),
            deferral_scheduled: Arc::new(AtomicBool::new(false)),
            last_batch_started: Mutex::new(None),
            trigger: Arc::new(Notify::new()),
            events,
        }
    }

    /// Identifies outgoing requests as coming from `courier_id`.
    pub fn with_courier(mut self, courier_id: impl Into<String>) -> Self {
        self.courier_id = Some(courier_id.into());
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Notified whenever the queue wants a drain sooner than the next tick.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    pub fn request_drain(&self) {
        self.trigger.notify_one();
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Persists `op`. Re-enqueueing an id that is already queued is a no-op
    /// and returns `false`.
    pub async fn enqueue(&self, op: PendingOperation) -> Result<bool, QueueError> {
        if let Some(snapshot) = self.dal.entity_snapshots().get(&op.entity_id).await? {
            if snapshot.is_terminal() {
                return Err(QueueError::DeliveryCompleted {
                    entity_id: op.entity_id,
                    status: snapshot.status,
                });
            }
        }

        let inserted = self.dal.pending_operations().enqueue(&op).await?;
        if inserted {
            debug!(
                operation_id = %op.operation_id,
                entity_id = %op.entity_id,
                operation_type = %op.op_type(),
                "Operation enqueued"
            );
            let _ = self.events.send(QueueEvent::Enqueued {
                operation_id: op.operation_id,
                entity_id: op.entity_id,
                operation_type: op.payload.op_type(),
            });
        }
        Ok(inserted)
    }

    /// Pending operations in processing order.
    pub async fn pending(&self) -> Result<Vec<PendingOperation>, QueueError> {
        Ok(self.dal.pending_operations().list().await?)
    }

    pub async fn pending_for(&self, entity_id: &str) -> Result<Vec<PendingOperation>, QueueError> {
        Ok(self.dal.pending_operations().list_for_entity(entity_id).await?)
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.dal.pending_operations().count().await? as usize)
    }

    /// Drops every pending operation for `entity_id`.
    pub async fn purge_entity(&self, entity_id: &str) -> Result<usize, QueueError> {
        let dropped = self.dal.pending_operations().purge_entity(entity_id).await?;
        self.locks.clear(entity_id);
        info!(entity_id, dropped, "Pending operations purged");
        Ok(dropped)
    }

    pub async fn error_records(
        &self,
        status: Option<ErrorRecordStatus>,
    ) -> Result<Vec<ErrorRecord>, QueueError> {
        Ok(self.dal.error_records().list(status).await?)
    }

    /// The last record confirmed by the service, if any.
    pub async fn snapshot(
        &self,
        entity_id: &str,
    ) -> Result<Option<DeliveryTrackingRecord>, QueueError> {
        Ok(self.dal.entity_snapshots().get(entity_id).await?)
    }

    /// Re-reads a record from the service and stores it as the snapshot.
    pub async fn refresh(&self, entity_id: &str) -> Result<DeliveryTrackingRecord, TransportError> {
        let record = self.transport.fetch_record(entity_id).await?;
        if let Err(e) = self.dal.entity_snapshots().save(&record).await {
            warn!(entity_id, error = %e, "Failed to store refreshed snapshot");
        }
        Ok(record)
    }

    /// Processes one batch of due operations.
    pub async fn process_batch(&self) -> Result<BatchReport, QueueError> {
        if !self.connectivity.is_online() {
            debug!("Offline, queue processing paused");
            return Ok(BatchReport::Paused);
        }
        let Some(_token) = ProcessingToken::claim(&self.processing) else {
            debug!("Batch already in flight");
            return Ok(BatchReport::AlreadyRunning);
        };

        let now = self.clock.now();
        let last_started = {
            let mut last = self.last_batch_started.lock();
            // A clock stepped backwards would otherwise defer every batch
            // until it caught up again.
            if last.is_some_and(|started| started > now) {
                *last = Some(now);
            }
            *last
        };
        if let Some(started) = last_started {
            let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
            if elapsed < self.min_flush_interval {
                let retry_in = self.min_flush_interval - elapsed;
                self.schedule_deferred_drain(retry_in);
                debug!(retry_in_ms = retry_in.as_millis() as u64, "Batch deferred");
                return Ok(BatchReport::Deferred { retry_in });
            }
        }

        let pending = self.dal.pending_operations().list().await?;
        let batch = select_batch(pending, self.batch_size, now);
        if batch.is_empty() {
            return Ok(BatchReport::Idle);
        }
        *self.last_batch_started.lock() = Some(now);
        debug!(size = batch.len(), "Processing batch");

        let results = join_all(batch.into_iter().map(|op| self.process_one(op))).await;

        let mut summary = BatchSummary::default();
        for result in results {
            summary.attempted += 1;
            match result {
                Ok(Settled::Succeeded) => summary.succeeded += 1,
                Ok(Settled::Retried) => summary.retried += 1,
                Ok(Settled::Resolved) => summary.resolved += 1,
                Ok(Settled::Failed) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "Failed to settle operation");
                    summary.store_errors += 1;
                }
            }
        }
        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            retried = summary.retried,
            resolved = summary.resolved,
            failed = summary.failed,
            "Batch processed"
        );
        Ok(BatchReport::Processed(summary))
    }

    fn schedule_deferred_drain(&self, retry_in: Duration) {
        if self.deferral_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let trigger = self.trigger.clone();
        let scheduled = self.deferral_scheduled.clone();
        tokio::spawn(async move {
            tokio::time::sleep(retry_in).await;
            scheduled.store(false, Ordering::Release);
            trigger.notify_one();
        });
    }

    async fn process_one(&self, op: PendingOperation) -> Result<Settled, StoreError> {
        let started = tokio::time::Instant::now();
        let snapshot = self.dal.entity_snapshots().get(&op.entity_id).await?;
        let result = self.send(&op, snapshot.as_ref()).await;
        let elapsed = started.elapsed();

        match result {
            Ok(record) => {
                self.monitor.record(op.op_type(), elapsed, Ok(()));
                self.settle_success(&op, record).await?;
                Ok(Settled::Succeeded)
            }
            Err(e) => {
                let error_type = classify(&e);
                self.monitor.record(op.op_type(), elapsed, Err(error_type));
                self.recover(op, error_type, e).await
            }
        }
    }

    /// Holds the client-side entity lock for the duration of the request.
    async fn send(
        &self,
        op: &PendingOperation,
        snapshot: Option<&DeliveryTrackingRecord>,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        let _guard = self
            .locks
            .try_acquire(&op.entity_id, &op.operation_id)
            .map_err(|busy| {
                TransportError::Rejected(ApiError::operation_in_progress(
                    &op.entity_id,
                    busy.held_by.as_deref(),
                ))
            })?;

        let expected_version = snapshot.map(|s| s.version);
        let courier_id = self.courier_id.clone();
        let operation_id = op.operation_id.clone();

        match &op.payload {
            OperationPayload::Location { sample } => {
                let request = LocationUpdateRequest {
                    operation_id,
                    sample: sample.clone(),
                    courier_id,
                };
                self.transport.update_location(&op.entity_id, request).await
            }
            OperationPayload::Status {
                status,
                notes,
                location,
            } => {
                let request = StatusUpdateRequest {
                    operation_id,
                    status: *status,
                    notes: notes.clone(),
                    location: location.clone(),
                    expected_version,
                    courier_id,
                };
                self.transport.update_status(&op.entity_id, request).await
            }
            OperationPayload::Completion { notes, location } => {
                let request = CompletionRequest {
                    operation_id,
                    notes: notes.clone(),
                    location: location.clone(),
                    expected_version,
                    courier_id,
                };
                self.transport.complete_delivery(&op.entity_id, request).await
            }
        }
    }

    async fn settle_success(
        &self,
        op: &PendingOperation,
        record: DeliveryTrackingRecord,
    ) -> Result<(), StoreError> {
        debug!(
            operation_id = %op.operation_id,
            entity_id = %op.entity_id,
            status = %record.status,
            version = record.version,
            "Operation confirmed"
        );
        let _ = self.events.send(QueueEvent::Succeeded {
            operation_id: op.operation_id.clone(),
            entity_id: op.entity_id.clone(),
            operation_type: op.op_type(),
            status: record.status,
            version: record.version,
        });

        if record.is_terminal() {
            self.close_entity(&record).await
        } else {
            self.dal
                .pending_operations()
                .complete(&op.operation_id, Some(record))
                .await
        }
    }

    async fn close_entity(&self, record: &DeliveryTrackingRecord) -> Result<(), StoreError> {
        let dropped = self.dal.pending_operations().close_entity(record).await?;
        self.locks.clear(&record.id);
        info!(
            entity_id = %record.id,
            status = %record.status,
            dropped,
            "Delivery closed, pending operations cleared"
        );
        let _ = self.events.send(QueueEvent::EntityClosed {
            entity_id: record.id.clone(),
            status: record.status,
            dropped,
        });
        Ok(())
    }

    async fn recover(
        &self,
        mut op: PendingOperation,
        error_type: ErrorType,
        cause: TransportError,
    ) -> Result<Settled, StoreError> {
        let now = self.clock.now();
        let policy = RecoveryPolicy::for_error(error_type);

        let mut record = match self.dal.error_records().get_by_operation(&op.operation_id).await? {
            Some(mut existing) => {
                existing.error_type = error_type;
                existing.max_retries = policy.max_retries;
                existing.strategy = policy.strategy;
                existing.last_error = Some(cause.to_string());
                existing.updated_at = now;
                existing
            }
            None => ErrorRecord::new(
                &op.operation_id,
                &op.entity_id,
                error_type,
                policy.max_retries,
                policy.strategy,
                Some(cause.to_string()),
                now,
            ),
        };

        let closed = signals_closed(&cause);
        let mut fresh = None;
        let mut refreshed = None;
        if policy.refreshes() || closed {
            match self.refresh(&op.entity_id).await {
                Ok(current) => {
                    refreshed = Some(applicability(&op.payload, &current));
                    fresh = Some(current);
                }
                Err(e) => {
                    debug!(entity_id = %op.entity_id, error = %e, "Refresh before retry failed")
                }
            }
        }

        let offline = !self.connectivity.is_online();
        let decision = match &fresh {
            Some(current) if closed && current.is_terminal() => {
                RecoveryDecision::ResolvedNoOp(Applicability::NoLongerApplicable)
            }
            _ => self.recovery.decide(&policy, op.retry_count, refreshed, offline),
        };
        match decision {
            RecoveryDecision::Retry {
                delay,
                consume_budget,
            } => {
                if consume_budget {
                    op.retry_count += 1;
                }
                op.not_before = (!delay.is_zero()).then(|| now + to_chrono(delay));
                record.retry_count = op.retry_count;
                record.status = ErrorRecordStatus::Pending;
                self.dal.pending_operations().requeue_front(&op, &record).await?;

                debug!(
                    operation_id = %op.operation_id,
                    entity_id = %op.entity_id,
                    %error_type,
                    retry_count = op.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Operation requeued for retry"
                );
                let _ = self.events.send(QueueEvent::RetryScheduled {
                    operation_id: op.operation_id,
                    entity_id: op.entity_id,
                    error_type,
                    retry_count: record.retry_count,
                    delay,
                });
                Ok(Settled::Retried)
            }
            RecoveryDecision::ResolvedNoOp(outcome) => {
                info!(
                    operation_id = %op.operation_id,
                    entity_id = %op.entity_id,
                    %error_type,
                    ?outcome,
                    "Operation resolved without re-applying"
                );
                let _ = self.events.send(QueueEvent::ResolvedNoOp {
                    operation_id: op.operation_id.clone(),
                    entity_id: op.entity_id.clone(),
                    error_type,
                    outcome,
                });
                match fresh {
                    Some(current) if current.is_terminal() => self.close_entity(&current).await?,
                    current => {
                        self.dal
                            .pending_operations()
                            .complete(&op.operation_id, current)
                            .await?
                    }
                }
                Ok(Settled::Resolved)
            }
            RecoveryDecision::Exhausted => {
                record.retry_count = op.retry_count;
                record.status = ErrorRecordStatus::Failed;
                self.dal
                    .pending_operations()
                    .settle_with_error(&op.operation_id, &record)
                    .await?;

                error!(
                    operation_id = %op.operation_id,
                    entity_id = %op.entity_id,
                    operation_type = %op.op_type(),
                    %error_type,
                    retry_count = op.retry_count,
                    max_retries = policy.max_retries,
                    error = %cause,
                    "Operation failed permanently"
                );
                let _ = self.events.send(QueueEvent::Failed {
                    operation_id: op.operation_id,
                    entity_id: op.entity_id,
                    error_type,
                    message: error_type.user_message(),
                    suggested_action: error_type.suggested_action(),
                    detail: cause.to_string(),
                });
                Ok(Settled::Failed)
            }
        }
    }
}

/// Picks up to `batch_size` due operations, at most one per delivery.
///
/// Only the head operation of each delivery is eligible, so a delivery whose
/// head is still waiting out a retry delay keeps its later operations
/// behind it.
fn select_batch(
    pending: Vec<PendingOperation>,
    batch_size: usize,
    now: DateTime<Utc>,
) -> Vec<PendingOperation> {
    let mut seen = HashSet::new();
    let mut batch = Vec::with_capacity(batch_size);
    for op in pending {
        if batch.len() == batch_size {
            break;
        }
        if !seen.insert(op.entity_id.clone()) {
            continue;
        }
        if op.is_due(now) {
            batch.push(op);
        }
    }
    batch
}
