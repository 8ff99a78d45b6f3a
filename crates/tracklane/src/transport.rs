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

//! Client-to-service transport.
//!
//! [`DeliveryTransport`] is the seam between the client queue and the
//! tracking service. Implementations report failures as a structured
//! [`TransportError`], which is what recovery classification matches on.

use crate::connectivity::ConnectivityMonitor;
use crate::error::TransportError;
use crate::models::delivery::DeliveryTrackingRecord;
use crate::tracking::TrackingService;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use crate::tracking::{CompletionRequest, LocationUpdateRequest, StatusUpdateRequest};

/// Carries mutation requests to the tracking service.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn update_status(
        &self,
        entity_id: &str,
        request: StatusUpdateRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError>;

    async fn update_location(
        &self,
        entity_id: &str,
        request: LocationUpdateRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError>;

    async fn complete_delivery(
        &self,
        entity_id: &str,
        request: CompletionRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError>;

    /// Reads the current authoritative record.
    async fn fetch_record(&self, entity_id: &str) -> Result<DeliveryTrackingRecord, TransportError>;
}

/// In-process transport that calls a [`TrackingService`] directly.
///
/// It honours the connectivity signal (offline requests fail with
/// [`TransportError::Offline`]) and a per-request timeout.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    service: Arc<TrackingService>,
    connectivity: ConnectivityMonitor,
    timeout: Duration,
}

impl LoopbackTransport {
    pub fn new(
        service: Arc<TrackingService>,
        connectivity: ConnectivityMonitor,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            connectivity,
            timeout,
        }
    }

    pub fn service(&self) -> &Arc<TrackingService> {
        &self.service
    }

    async fn call<F>(&self, request: F) -> Result<DeliveryTrackingRecord, TransportError>
    where
        F: Future<Output = Result<DeliveryTrackingRecord, crate::error::ApiError>>,
    {
        if !self.connectivity.is_online() {
            return Err(TransportError::Offline);
        }
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(TransportError::Rejected),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl DeliveryTransport for LoopbackTransport {
    async fn update_status(
        &self,
        entity_id: &str,
        request: StatusUpdateRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        self.call(self.service.update_status(entity_id, request)).await
    }

    async fn update_location(
        &self,
        entity_id: &str,
        request: LocationUpdateRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        self.call(self.service.update_location(entity_id, request)).await
    }

    async fn complete_delivery(
        &self,
        entity_id: &str,
        request: CompletionRequest,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        self.call(self.service.complete_delivery(entity_id, request)).await
    }

    async fn fetch_record(
        &self,
        entity_id: &str,
    ) -> Result<DeliveryTrackingRecord, TransportError> {
        let service = self.service.clone();
        let entity_id = entity_id.to_string();
        self.call(async move { service.get(&entity_id) }).await
    }
}
