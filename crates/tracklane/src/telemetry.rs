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

//! Location telemetry batching.
//!
//! Couriers report positions far more often than the service needs them.
//! [`TelemetryBatcher`] filters and coalesces the stream before anything is
//! queued:
//!
//! - a sample within the dedup distance and dedup window of the last accepted
//!   sample for the same delivery is a duplicate. If the earlier sample is
//!   still buffered the newer one replaces it; otherwise it is discarded.
//! - only the newest buffered sample per delivery survives to a flush, and a
//!   sample older than the last accepted one is discarded
//! - a flush runs after a quiet period (the debounce), or immediately for a
//!   high priority sample
//!
//! Each flushed sample becomes one `location_update` operation.

use crate::clock::{to_chrono, Clock};
use crate::config::TrackingConfig;
use crate::error::QueueError;
use crate::geo::haversine_distance_m;
use crate::models::delivery::LocationSample;
use crate::models::operation::{PendingOperation, Priority};
use crate::queue::OperationQueue;
use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What happened to a submitted sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Buffered until the next flush
    Buffered,
    /// A duplicate that replaced the still-buffered earlier sample
    Superseded,
    /// A duplicate of a sample that was already flushed
    Discarded,
    /// Flushed straight away; `queued` operations were enqueued
    Flushed { queued: usize },
}

/// Result of offering a sample to a [`SampleBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    Superseded,
    Discarded,
}

#[derive(Debug)]
struct EntityBuffer {
    last_accepted: LocationSample,
    pending: Option<(LocationSample, Priority)>,
}

/// The synchronous dedup and coalescing rules.
#[derive(Debug)]
pub struct SampleBuffer {
    dedup_distance_m: f64,
    dedup_window: ChronoDuration,
    entities: HashMap<String, EntityBuffer>,
}

impl SampleBuffer {
    pub fn new(dedup_distance_m: f64, dedup_window: Duration) -> Self {
        Self {
            dedup_distance_m,
            dedup_window: to_chrono(dedup_window),
            entities: HashMap::new(),
        }
    }

    fn is_duplicate(&self, previous: &LocationSample, sample: &LocationSample) -> bool {
        let gap = (sample.timestamp - previous.timestamp).abs();
        gap <= self.dedup_window
            && haversine_distance_m(previous.point(), sample.point()) <= self.dedup_distance_m
    }

    /// Samples older than the last accepted one are discarded, so a late
    /// arrival never replaces a newer position.
    pub fn offer(&mut self, entity_id: &str, sample: LocationSample, priority: Priority) -> Offer {
        let Some(entry) = self.entities.get(entity_id) else {
            self.entities.insert(
                entity_id.to_string(),
                EntityBuffer {
                    last_accepted: sample.clone(),
                    pending: Some((sample, priority)),
                },
            );
            return Offer::Accepted;
        };
        if sample.timestamp < entry.last_accepted.timestamp {
            return Offer::Discarded;
        }

        let duplicate = self.is_duplicate(&entry.last_accepted, &sample);
        let Some(entry) = self.entities.get_mut(entity_id) else {
            return Offer::Discarded;
        };
        match (duplicate, entry.pending.take()) {
            (true, None) => Offer::Discarded,
            (true, Some((_, previous))) => {
                entry.last_accepted = sample.clone();
                entry.pending = Some((sample, priority.max(previous)));
                Offer::Superseded
            }
            (false, previous) => {
                let priority = previous.map_or(priority, |(_, p)| priority.max(p));
                entry.last_accepted = sample.clone();
                entry.pending = Some((sample, priority));
                Offer::Accepted
            }
        }
    }

    /// Puts back a drained sample that could not be enqueued.
    ///
    /// A newer sample buffered in the meantime wins; it keeps the higher of
    /// the two priorities.
    pub fn restore(&mut self, entity_id: &str, sample: LocationSample, priority: Priority) {
        let entry = self
            .entities
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityBuffer {
                last_accepted: sample.clone(),
                pending: None,
            });
        entry.pending = match entry.pending.take() {
            Some((newer, p)) if newer.timestamp >= sample.timestamp => {
                Some((newer, p.max(priority)))
            }
            Some((_, p)) => Some((sample, p.max(priority))),
            None => Some((sample, priority)),
        };
    }

    /// Takes the newest buffered sample of every delivery.
    pub fn drain(&mut self) -> Vec<(String, LocationSample, Priority)> {
        let mut drained: Vec<_> = self
            .entities
            .iter_mut()
            .filter_map(|(entity_id, entry)| {
                entry
                    .pending
                    .take()
                    .map(|(sample, priority)| (entity_id.clone(), sample, priority))
            })
            .collect();
        drained.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp));
        drained
    }

    pub fn pending_count(&self) -> usize {
        self.entities.values().filter(|e| e.pending.is_some()).count()
    }

    pub fn pending_sample(&self, entity_id: &str) -> Option<&LocationSample> {
        self.entities
            .get(entity_id)
            .and_then(|e| e.pending.as_ref())
            .map(|(sample, _)| sample)
    }

    pub fn forget(&mut self, entity_id: &str) {
        self.entities.remove(entity_id);
    }
}

/// Debounced front end to the operation queue for location samples.
pub struct TelemetryBatcher {
    buffer: Mutex<SampleBuffer>,
    queue: Arc<OperationQueue>,
    clock: Arc<dyn Clock>,
    debounce: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TelemetryBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBatcher")
            .field("debounce", &self.debounce)
            .field("buffered", &self.buffer.lock().pending_count())
            .finish()
    }
}

impl TelemetryBatcher {
    pub fn new(config: &TrackingConfig, queue: Arc<OperationQueue>, clock: Arc<dyn Clock>) -> Self {
        Self {
            buffer: Mutex::new(SampleBuffer::new(
                config.dedup_distance_m(),
                config.dedup_window(),
            )),
            queue,
            clock,
            debounce: config.debounce(),
            timer: Mutex::new(None),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().pending_count()
    }

    pub fn buffered_sample(&self, entity_id: &str) -> Option<LocationSample> {
        self.buffer.lock().pending_sample(entity_id).cloned()
    }

    /// Submits a sample for `entity_id`.
    ///
    /// A high priority sample flushes the whole buffer at once. Otherwise a
    /// newly accepted sample restarts the debounce timer; a superseding
    /// duplicate leaves the timer alone.
    pub async fn submit(
        self: &Arc<Self>,
        entity_id: &str,
        sample: LocationSample,
        priority: Priority,
    ) -> Result<SubmitOutcome, QueueError> {
        let offer = self.buffer.lock().offer(entity_id, sample, priority);

        if priority == Priority::High && offer != Offer::Discarded {
            self.cancel_timer();
            let queued = self.flush().await?;
            return Ok(SubmitOutcome::Flushed { queued });
        }

        Ok(match offer {
            Offer::Accepted => {
                self.restart_timer();
                SubmitOutcome::Buffered
            }
            Offer::Superseded => {
                debug!(entity_id, "Duplicate sample superseded buffered sample");
                SubmitOutcome::Superseded
            }
            Offer::Discarded => {
                debug!(entity_id, "Duplicate sample discarded");
                SubmitOutcome::Discarded
            }
        })
    }

    /// Enqueues the newest buffered sample of every delivery.
    ///
    /// Deliveries that have since completed are dropped from the buffer.
    /// A sample that fails for any other reason goes back into the buffer
    /// for the next flush, and the first such failure is reported after
    /// every sample has been tried.
    pub async fn flush(&self) -> Result<usize, QueueError> {
        let drained = self.buffer.lock().drain();
        if drained.is_empty() {
            return Ok(0);
        }

        let now = self.clock.now();
        let mut queued = 0;
        let mut first_error = None;
        for (entity_id, sample, priority) in drained {
            let op = PendingOperation::location_update(&entity_id, sample.clone(), priority, now);
            match self.queue.enqueue(op).await {
                Ok(_) => queued += 1,
                Err(QueueError::DeliveryCompleted { status, .. }) => {
                    debug!(entity_id = %entity_id, %status, "Dropping samples for closed delivery");
                    self.buffer.lock().forget(&entity_id);
                }
                Err(e) => {
                    warn!(entity_id = %entity_id, error = %e, "Failed to enqueue location sample");
                    self.buffer.lock().restore(&entity_id, sample, priority);
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(queued, "Telemetry flushed");
        if queued > 0 {
            self.queue.request_drain();
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(queued),
        }
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    fn restart_timer(self: &Arc<Self>) {
        let batcher = Arc::downgrade(self);
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(batcher) = batcher.upgrade() else {
                return;
            };
            batcher.timer.lock().take();
            if let Err(e) = batcher.flush().await {
                warn!(error = %e, "Debounced telemetry flush failed");
            }
        });
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the debounce timer without flushing.
    pub fn shutdown(&self) {
        self.cancel_timer();
    }
}
