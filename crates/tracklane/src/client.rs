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

//! Client facade.
//!
//! [`TrackingClient`] is what a courier app holds. It owns the durable queue,
//! the telemetry batcher and the monitor, and runs three background loops
//! once started:
//!
//! - the drain loop, which processes a batch every `drain_interval` and
//!   whenever the queue asks for a drain
//! - the reconnection watcher, which asks for a drain as soon as
//!   connectivity returns
//! - the health check, which evaluates the monitor every
//!   `health_check_interval`
//!
//! Status and completion requests are checked locally against the projected
//! status before they are queued, so obviously invalid requests fail fast.
//! Everything else is decided by the service.

use crate::clock::{Clock, SystemClock};
use crate::config::TrackingConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::dal::DAL;
use crate::database::Database;
use crate::error::{ClientError, QueueError, TransportError};
use crate::models::delivery::{DeliveryStatus, DeliveryTrackingRecord, LocationSample};
use crate::models::error_record::{ErrorRecord, ErrorRecordStatus};
use crate::models::operation::{PendingOperation, Priority};
use crate::monitor::{AlertListener, HealthReport, MonitoringSnapshot, OperationMonitor};
use crate::queue::{BatchReport, OperationQueue, QueueEvent};
use crate::scheduler::PeriodicTask;
use crate::telemetry::{SubmitOutcome, TelemetryBatcher};
use crate::transition::{Actor, TransitionGuard};
use crate::transport::DeliveryTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Watcher {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Offline-first tracking client.
pub struct TrackingClient {
    config: TrackingConfig,
    queue: Arc<OperationQueue>,
    batcher: Arc<TelemetryBatcher>,
    monitor: Arc<OperationMonitor>,
    connectivity: ConnectivityMonitor,
    guard: TransitionGuard,
    clock: Arc<dyn Clock>,
    drain_task: PeriodicTask,
    health_task: PeriodicTask,
    watcher: Mutex<Option<Watcher>>,
}

impl std::fmt::Debug for TrackingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingClient")
            .field("queue", &self.queue)
            .field("online", &self.connectivity.is_online())
            .field("drain_task", &self.drain_task)
            .finish()
    }
}

impl TrackingClient {
    pub fn builder() -> TrackingClientBuilder {
        TrackingClientBuilder::default()
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn batcher(&self) -> &Arc<TelemetryBatcher> {
        &self.batcher
    }

    pub fn monitor(&self) -> &Arc<OperationMonitor> {
        &self.monitor
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn add_alert_listener(&self, listener: Arc<dyn AlertListener>) {
        self.monitor.add_listener(listener);
    }

    /// Starts the background loops. Calling it again while they run is a
    /// no-op, and it may be called again after [`TrackingClient::shutdown`].
    pub fn start(&self) {
        self.drain_task.start();
        self.health_task.start();

        let mut watcher = self.watcher.lock();
        if watcher.as_ref().map_or(false, |w| !w.handle.is_finished()) {
            return;
        }
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let mut changes = self.connectivity.subscribe();
        let queue = self.queue.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *changes.borrow_and_update() {
                            info!("Back online, draining queue");
                            queue.request_drain();
                        }
                    }
                }
            }
        });
        *watcher = Some(Watcher { shutdown, handle });
        info!("Tracking client started");
    }

    /// Stops the background loops, enqueueing any buffered telemetry first.
    pub async fn shutdown(&self) {
        self.batcher.shutdown();
        if let Err(e) = self.batcher.flush().await {
            warn!(error = %e, "Failed to flush telemetry on shutdown");
        }

        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.shutdown.send(());
            let _ = watcher.handle.await;
        }
        self.drain_task.stop().await;
        self.health_task.stop().await;
        info!("Tracking client stopped");
    }

    /// Queues a status change for `entity_id` and returns the operation id.
    ///
    /// Asking again for a status that is already queued returns the queued
    /// operation's id and queues nothing.
    pub async fn request_status_update(
        &self,
        entity_id: &str,
        status: DeliveryStatus,
        notes: Option<String>,
        location: Option<LocationSample>,
    ) -> Result<String, QueueError> {
        if let Some(queued) = self.precheck(entity_id, status, location.as_ref()).await? {
            return Ok(queued);
        }
        let op = PendingOperation::status_update(entity_id, status, notes, location, self.now());
        self.submit_operation(op).await
    }

    /// Queues the completion of `entity_id` and returns the operation id.
    pub async fn request_completion(
        &self,
        entity_id: &str,
        notes: Option<String>,
        location: Option<LocationSample>,
    ) -> Result<String, QueueError> {
        if let Some(queued) = self
            .precheck(entity_id, DeliveryStatus::Delivered, location.as_ref())
            .await?
        {
            return Ok(queued);
        }
        let op = PendingOperation::delivery_completion(entity_id, notes, location, self.now());
        self.submit_operation(op).await
    }

    /// Hands a position report to the telemetry batcher.
    pub async fn submit_location(
        &self,
        entity_id: &str,
        sample: LocationSample,
        priority: Priority,
    ) -> Result<SubmitOutcome, QueueError> {
        self.batcher.submit(entity_id, sample, priority).await
    }

    /// Processes one batch now.
    pub async fn drain(&self) -> Result<BatchReport, QueueError> {
        self.queue.process_batch().await
    }

    /// Re-reads `entity_id` from the service into the local snapshot.
    pub async fn refresh(&self, entity_id: &str) -> Result<DeliveryTrackingRecord, TransportError> {
        self.queue.refresh(entity_id).await
    }

    pub async fn snapshot(
        &self,
        entity_id: &str,
    ) -> Result<Option<DeliveryTrackingRecord>, QueueError> {
        self.queue.snapshot(entity_id).await
    }

    pub async fn pending(&self) -> Result<Vec<PendingOperation>, QueueError> {
        self.queue.pending().await
    }

    pub async fn error_records(
        &self,
        status: Option<ErrorRecordStatus>,
    ) -> Result<Vec<ErrorRecord>, QueueError> {
        self.queue.error_records(status).await
    }

    pub fn check_health(&self) -> HealthReport {
        self.monitor.check_health()
    }

    pub fn monitoring_snapshot(&self) -> MonitoringSnapshot {
        self.monitor.snapshot()
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    async fn submit_operation(&self, op: PendingOperation) -> Result<String, QueueError> {
        let operation_id = op.operation_id.clone();
        self.queue.enqueue(op).await?;
        self.queue.request_drain();
        Ok(operation_id)
    }

    /// Checks a requested transition against the status the delivery will
    /// have once already-queued status operations apply.
    ///
    /// Returns the id of the last queued operation when it already moves the
    /// delivery to `target`.
    async fn precheck(
        &self,
        entity_id: &str,
        target: DeliveryStatus,
        location: Option<&LocationSample>,
    ) -> Result<Option<String>, QueueError> {
        let mut snapshot = self.queue.snapshot(entity_id).await?;
        if snapshot.is_none() && self.connectivity.is_online() {
            snapshot = self.queue.refresh(entity_id).await.ok();
        }
        let Some(snapshot) = snapshot else {
            debug!(entity_id, "No local snapshot, skipping local transition check");
            return Ok(None);
        };
        if snapshot.is_terminal() {
            return Err(QueueError::DeliveryCompleted {
                entity_id: entity_id.to_string(),
                status: snapshot.status,
            });
        }

        let queued = self
            .queue
            .pending_for(entity_id)
            .await?
            .into_iter()
            .rev()
            .find_map(|op| op.payload.target_status().map(|status| (op.operation_id, status)));
        let queued_target = match queued {
            Some((operation_id, status)) if status == target => {
                debug!(entity_id, %target, operation_id = %operation_id, "Status already queued");
                return Ok(Some(operation_id));
            }
            Some((_, status)) => Some(status),
            None => None,
        };

        let mut projected = snapshot;
        if let Some(status) = queued_target {
            projected.status = status;
        }
        let Err(rejection) = self.guard.check(&projected, target, location, Actor::Courier) else {
            return Ok(None);
        };

        // The snapshot may be behind the service; check once more on fresh data
        if queued_target.is_none() && self.connectivity.is_online() {
            if let Ok(fresh) = self.queue.refresh(entity_id).await {
                if fresh.status != projected.status {
                    return self
                        .guard
                        .check(&fresh, target, location, Actor::Courier)
                        .map(|_| None)
                        .map_err(|r| QueueError::Rejected(r.into_api_error(fresh.status, target)));
                }
            }
        }
        debug!(entity_id, current = %projected.status, %target, "Request rejected locally");
        Err(QueueError::Rejected(
            rejection.into_api_error(projected.status, target),
        ))
    }
}

/// Builder for [`TrackingClient`].
#[derive(Default)]
pub struct TrackingClientBuilder {
    config: Option<TrackingConfig>,
    transport: Option<Arc<dyn DeliveryTransport>>,
    clock: Option<Arc<dyn Clock>>,
    connectivity: Option<ConnectivityMonitor>,
    database: Option<Database>,
    courier_id: Option<String>,
}

impl TrackingClientBuilder {
    pub fn config(mut self, config: TrackingConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn DeliveryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Uses an already opened store instead of `config.database_url()`.
    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn courier_id(mut self, courier_id: impl Into<String>) -> Self {
        self.courier_id = Some(courier_id.into());
        self
    }

    /// Opens the store, runs migrations and wires the components together.
    /// Background loops are not started.
    pub async fn build(self) -> Result<TrackingClient, ClientError> {
        let config = self.config.unwrap_or_default();
        let transport = self.transport.ok_or(ClientError::MissingTransport)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let connectivity = self.connectivity.unwrap_or_default();
        let database = match self.database {
            Some(database) => database,
            None => Database::new(config.database_url())?,
        };
        database.run_migrations().await?;

        let monitor = Arc::new(OperationMonitor::from_config(&config, clock.clone()));
        let mut queue = OperationQueue::new(
            &config,
            DAL::new(database),
            transport,
            monitor.clone(),
            connectivity.clone(),
            clock.clone(),
        );
        if let Some(courier_id) = self.courier_id {
            queue = queue.with_courier(courier_id);
        }
        let queue = Arc::new(queue);
        let batcher = Arc::new(TelemetryBatcher::new(&config, queue.clone(), clock.clone()));

        let drain_queue = queue.clone();
        let drain_task = PeriodicTask::new("queue-drain", config.drain_interval(), move || {
            let queue = drain_queue.clone();
            async move {
                if let Err(e) = queue.process_batch().await {
                    warn!(error = %e, "Queue drain failed");
                }
            }
        })
        .with_trigger(queue.trigger());

        let health_monitor = monitor.clone();
        let health_task =
            PeriodicTask::new("health-check", config.health_check_interval(), move || {
                let monitor = health_monitor.clone();
                async move {
                    let report = monitor.check_health();
                    debug!(healthy = report.healthy, "Health evaluated");
                }
            });

        info!(database = %config.database_url(), "Tracking client built");
        Ok(TrackingClient {
            guard: TransitionGuard::new(config.arrival_threshold_m()),
            config,
            queue,
            batcher,
            monitor,
            connectivity,
            clock,
            drain_task,
            health_task,
            watcher: Mutex::new(None),
        })
    }
}
