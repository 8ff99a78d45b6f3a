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

//! Shared setup for the integration tests.
//!
//! A [`Harness`] is one authoritative [`TrackingService`] holding a single
//! assigned delivery, plus a [`TrackingClient`] with its own throw-away SQLite
//! store. Time is a [`ManualClock`] shared by both, so lock staleness, retry
//! delays and flush spacing are all advanced explicitly by the test.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tracklane::transport::{CompletionRequest, LocationUpdateRequest, StatusUpdateRequest};
use tracklane::{
    ConnectivityMonitor, DeliveryStatus, DeliveryTrackingRecord, DeliveryTransport, GeoPoint,
    LocationSample, LoopbackTransport, ManualClock, QueueEvent, TrackingClient, TrackingConfig,
    TrackingConfigBuilder, TrackingService, TransportError,
};

static INIT: Once = Once::new();

pub const DELIVERY: &str = "delivery-1";
pub const ORDER: &str = "order-1";
pub const COURIER: &str = "courier-1";

pub fn pickup() -> GeoPoint {
    GeoPoint::new(40.7128, -74.0060)
}

pub fn dropoff() -> GeoPoint {
    GeoPoint::new(40.7306, -73.9866)
}

/// A sample `meters` due north of `point`, stamped with the clock's time.
pub fn sample_near(clock: &ManualClock, point: GeoPoint, meters: f64) -> LocationSample {
    use tracklane::Clock;
    let at = tracklane::geo::offset_north(point, meters);
    LocationSample::new(at.latitude, at.longitude, clock.now())
}

/// Transport wrapper that fails scripted calls before delegating.
///
/// Only mutations are affected; `fetch_record` always reaches the service.
pub struct FaultInjectingTransport {
    inner: LoopbackTransport,
    faults: Mutex<VecDeque<TransportError>>,
    calls: AtomicUsize,
}

impl FaultInjectingTransport {
    pub fn new(inner: LoopbackTransport) -> Self {
        Self {
            inner,
            faults: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails the next `times` mutation calls with `error`.
    pub fn fail_next(&self, error: TransportError, times: usize) {
        let mut faults = self.faults.lock();
        for _ in 0..times {
            faults.push_back(error.clone());
        }
    }

    /// Number of mutation calls seen, failed or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_fault(&self) -> Option<TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.faults.lock().pop_front()
    }
}

#[async_trait]
impl DeliveryTransport for FaultInjectingTransport {
    async fn update_status(
        &self,
        entity_id: &str,
        request: StatusUpdateRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        if let Some(fault) = self.next_fault() {
            return Err(fault);
        }
        self.inner.update_status(entity_id, request).await
    }

    async fn update_location(
        &self,
        entity_id: &str,
        request: LocationUpdateRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        if let Some(fault) = self.next_fault() {
            return Err(fault);
        }
        self.inner.update_location(entity_id, request).await
    }

    async fn complete_delivery(
        &self,
        entity_id: &str,
        request: CompletionRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        if let Some(fault) = self.next_fault() {
            return Err(fault);
        }
        self.inner.complete_delivery(entity_id, request).await
    }

    async fn fetch_record(
        &self,
        entity_id: &str,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        self.inner.fetch_record(entity_id).await
    }
}

/// One service, one client, one shared clock.
pub struct Harness {
    pub clock: ManualClock,
    pub service: Arc<TrackingService>,
    pub connectivity: ConnectivityMonitor,
    pub transport: Arc<FaultInjectingTransport>,
    pub client: TrackingClient,
    pub dir: TempDir,
}

impl Harness {
    /// Moves time past the minimum flush spacing and any retry delay, then
    /// processes one batch.
    pub async fn drain_later(&self) -> tracklane::BatchReport {
        self.clock.advance(chrono::Duration::seconds(60));
        self.client.drain().await.expect("Failed to drain queue")
    }

    pub async fn status(&self) -> DeliveryStatus {
        self.service
            .get(DELIVERY)
            .expect("Delivery should exist")
            .status
    }

    /// Creates and assigns another delivery on the service.
    pub fn add_delivery(&self, id: &str) {
        self.service
            .create_delivery(id, &format!("order-for-{}", id), pickup(), dropoff())
            .expect("Failed to create delivery");
        self.service
            .assign(id, COURIER)
            .expect("Failed to assign courier");
    }

    /// A second client with its own store, talking to the same service.
    pub async fn peer_client(&self) -> (TempDir, TrackingClient) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let transport = Arc::new(FaultInjectingTransport::new(LoopbackTransport::new(
            self.service.clone(),
            self.connectivity.clone(),
            Duration::from_secs(15),
        )));
        let client = build_client(
            dir.path(),
            &self.clock,
            self.connectivity.clone(),
            transport,
            |b| b,
        )
        .await;
        (dir, client)
    }

    /// Opens a second client on the same store, as after a process restart.
    pub async fn reopen_client(&self) -> TrackingClient {
        build_client(
            self.dir.path(),
            &self.clock,
            self.connectivity.clone(),
            self.transport.clone(),
            |b| b,
        )
        .await
    }
}

pub fn base_config(dir: &std::path::Path) -> TrackingConfigBuilder {
    TrackingConfig::builder().database_url(dir.join("client.db").display().to_string())
}

async fn build_client(
    dir: &std::path::Path,
    clock: &ManualClock,
    connectivity: ConnectivityMonitor,
    transport: Arc<FaultInjectingTransport>,
    tweak: impl FnOnce(TrackingConfigBuilder) -> TrackingConfigBuilder,
) -> TrackingClient {
    let config = tweak(base_config(dir))
        .build()
        .expect("Failed to build test config");
    TrackingClient::builder()
        .config(config)
        .transport(transport)
        .clock(Arc::new(clock.clone()))
        .connectivity(connectivity)
        .courier_id(COURIER)
        .build()
        .await
        .expect("Failed to build client")
}

pub async fn harness() -> Harness {
    harness_with(Duration::ZERO, |b| b).await
}

/// Builds a harness whose service waits `apply_latency` inside every
/// mutation and whose client config is adjusted by `tweak`.
pub async fn harness_with(
    apply_latency: Duration,
    tweak: impl FnOnce(TrackingConfigBuilder) -> TrackingConfigBuilder,
) -> Harness {
    INIT.call_once(|| tracklane::init_logging(None));

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let clock = ManualClock::default();
    let service_config = TrackingConfig::default();
    let service = Arc::new(
        TrackingService::new(&service_config, Arc::new(clock.clone()))
            .with_apply_latency(apply_latency),
    );
    service
        .create_delivery(DELIVERY, ORDER, pickup(), dropoff())
        .expect("Failed to create delivery");
    service
        .assign(DELIVERY, COURIER)
        .expect("Failed to assign courier");

    let connectivity = ConnectivityMonitor::default();
    let transport = Arc::new(FaultInjectingTransport::new(LoopbackTransport::new(
        service.clone(),
        connectivity.clone(),
        Duration::from_secs(15),
    )));
    let client = build_client(
        dir.path(),
        &clock,
        connectivity.clone(),
        transport.clone(),
        tweak,
    )
    .await;

    Harness {
        clock,
        service,
        connectivity,
        transport,
        client,
        dir,
    }
}

/// Everything currently buffered on an event receiver.
pub fn collect_events(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
