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

//! Authoritative service behaviour under concurrent writers.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracklane::tracking::{NotificationSink, OrderStatusSink, StatusChange};
use tracklane::transport::{CompletionRequest, StatusUpdateRequest};
use tracklane::{
    ApiError, ApiErrorCode, DeliveryStatus, ManualClock, TrackingConfig, TrackingService,
};

use crate::fixtures::{dropoff, pickup, sample_near, COURIER, DELIVERY, ORDER};

fn service_with(latency: Duration) -> (Arc<TrackingService>, ManualClock) {
    let clock = ManualClock::default();
    let service = TrackingService::new(&TrackingConfig::default(), Arc::new(clock.clone()))
        .with_apply_latency(latency);
    service
        .create_delivery(DELIVERY, ORDER, pickup(), dropoff())
        .expect("Failed to create delivery");
    service
        .assign(DELIVERY, COURIER)
        .expect("Failed to assign courier");
    (Arc::new(service), clock)
}

fn request(operation_id: &str, status: DeliveryStatus) -> StatusUpdateRequest {
    StatusUpdateRequest {
        operation_id: operation_id.to_string(),
        status,
        notes: None,
        location: None,
        expected_version: None,
        courier_id: Some(COURIER.to_string()),
    }
}

/// Two writers race for the same delivery: exactly one applies, the other
/// is told the record is busy, and the loser's replay does not apply twice.
#[tokio::test]
async fn test_concurrent_writers_are_mutually_exclusive() {
    let (service, _) = service_with(Duration::from_millis(100));

    let (first, second) = tokio::join!(
        service.update_status(DELIVERY, request("op-a", DeliveryStatus::HeadingToPickup)),
        service.update_status(DELIVERY, request("op-b", DeliveryStatus::HeadingToPickup)),
    );

    let outcomes = [first, second];
    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    let loser = outcomes
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("One writer should lose");
    assert_eq!(loser.code, ApiErrorCode::OperationInProgress);

    let record = service.get(DELIVERY).unwrap();
    assert_eq!(record.version, 1);
    assert!(!record.lock.is_held());

    // The loser retrying now finds its target already reached
    let retry = service
        .update_status(DELIVERY, request("op-b", DeliveryStatus::HeadingToPickup))
        .await;
    let retry = match retry {
        Ok(record) => record,
        Err(e) => {
            assert_eq!(e.code, ApiErrorCode::InvalidStatusTransition);
            service.get(DELIVERY).unwrap()
        }
    };
    assert_eq!(retry.version, 1);
}

/// A lock held for less than the TTL blocks a second operation.
#[tokio::test]
async fn test_young_lock_blocks_new_operation() {
    let (service, clock) = service_with(Duration::from_millis(200));

    let holder = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .update_status(DELIVERY, request("op-a", DeliveryStatus::HeadingToPickup))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    clock.advance(chrono::Duration::seconds(29));

    let blocked = service
        .update_status(DELIVERY, request("op-b", DeliveryStatus::Cancelled))
        .await
        .unwrap_err();
    assert_eq!(blocked.code, ApiErrorCode::OperationInProgress);

    let applied = holder.await.unwrap().unwrap();
    assert_eq!(applied.status, DeliveryStatus::HeadingToPickup);
}

/// A lock older than the TTL is reclaimed, and the original holder does not
/// write once it resumes.
#[tokio::test]
async fn test_stale_lock_is_reclaimed() {
    let (service, clock) = service_with(Duration::from_millis(200));

    let stalled = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .update_status(DELIVERY, request("op-a", DeliveryStatus::HeadingToPickup))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    clock.advance(chrono::Duration::seconds(31));

    let reclaimed = service
        .update_status(DELIVERY, request("op-b", DeliveryStatus::Cancelled))
        .await
        .expect("Stale lock should be reclaimed");
    assert_eq!(reclaimed.status, DeliveryStatus::Cancelled);

    let lost = stalled.await.unwrap().unwrap_err();
    assert_eq!(lost.code, ApiErrorCode::OperationInProgress);

    let record = service.get(DELIVERY).unwrap();
    assert_eq!(record.status, DeliveryStatus::Cancelled);
    assert_eq!(record.version, 1);
}

/// `at_pickup` 250m from the pickup point is rejected with the measured
/// distance; 150m is accepted.
#[tokio::test]
async fn test_arrival_gating_by_distance() {
    let (service, clock) = service_with(Duration::ZERO);
    service
        .update_status(DELIVERY, request("op-1", DeliveryStatus::HeadingToPickup))
        .await
        .unwrap();

    let mut far = request("op-2", DeliveryStatus::AtPickup);
    far.location = Some(sample_near(&clock, pickup(), 250.0));
    let error = service.update_status(DELIVERY, far).await.unwrap_err();
    assert_eq!(error.code, ApiErrorCode::TooFarFromDestination);
    let measured = error.distance_m.expect("distance should be reported");
    assert!((measured - 250.0).abs() < 1.0, "measured {}", measured);
    assert_eq!(error.allowed_distance_m, Some(200.0));
    assert_eq!(error.current_status, Some(DeliveryStatus::HeadingToPickup));
    assert_eq!(error.attempted_status, Some(DeliveryStatus::AtPickup));

    let mut near = request("op-3", DeliveryStatus::AtPickup);
    near.location = Some(sample_near(&clock, pickup(), 150.0));
    let record = service.update_status(DELIVERY, near).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::AtPickup);
    assert!(record.current_location.is_some());
}

/// The courier cannot leave `at_pickup`; the merchant confirmation can.
#[tokio::test]
async fn test_merchant_confirmation_gate() {
    let (service, clock) = service_with(Duration::ZERO);
    service
        .update_status(DELIVERY, request("op-1", DeliveryStatus::HeadingToPickup))
        .await
        .unwrap();
    let mut arrive = request("op-2", DeliveryStatus::AtPickup);
    arrive.location = Some(sample_near(&clock, pickup(), 10.0));
    service.update_status(DELIVERY, arrive).await.unwrap();

    let error = service
        .update_status(DELIVERY, request("op-3", DeliveryStatus::PickedUp))
        .await
        .unwrap_err();
    assert_eq!(error.code, ApiErrorCode::WaitingMerchantConfirmation);

    let record = service.confirm_pickup(DELIVERY, "merchant-1").await.unwrap();
    assert_eq!(record.status, DeliveryStatus::PickedUp);

    // Confirming again is no longer possible
    let again = service.confirm_pickup(DELIVERY, "merchant-2").await.unwrap_err();
    assert_eq!(again.code, ApiErrorCode::InvalidStatusTransition);
}

#[derive(Default)]
struct Recorder {
    orders: Mutex<Vec<(String, DeliveryStatus)>>,
    changes: Mutex<Vec<StatusChange>>,
}

impl OrderStatusSink for Recorder {
    fn mirror_status(&self, order_id: &str, status: DeliveryStatus) -> Result<(), ApiError> {
        self.orders.lock().push((order_id.to_string(), status));
        Ok(())
    }
}

impl NotificationSink for Recorder {
    fn notify(&self, change: &StatusChange) {
        self.changes.lock().push(change.clone());
    }
}

/// Delivery mirrors into the order once; every status change notifies.
#[tokio::test]
async fn test_delivery_mirrors_order_and_notifies() {
    let clock = ManualClock::default();
    let recorder = Arc::new(Recorder::default());
    let service = TrackingService::new(&TrackingConfig::default(), Arc::new(clock.clone()))
        .with_order_sink(recorder.clone())
        .with_notification_sink(recorder.clone());
    service
        .create_delivery(DELIVERY, ORDER, pickup(), dropoff())
        .unwrap();

    let steps = [
        (DeliveryStatus::HeadingToPickup, None),
        (DeliveryStatus::AtPickup, Some(sample_near(&clock, pickup(), 20.0))),
    ];
    for (n, (status, location)) in steps.into_iter().enumerate() {
        let mut req = request(&format!("op-{}", n), status);
        req.courier_id = None;
        req.location = location;
        service.update_status(DELIVERY, req).await.unwrap();
    }
    service.confirm_pickup(DELIVERY, "merchant-1").await.unwrap();

    let mut at_delivery = request("op-at-delivery", DeliveryStatus::AtDelivery);
    at_delivery.courier_id = None;
    at_delivery.location = Some(sample_near(&clock, dropoff(), 5.0));
    service.update_status(DELIVERY, at_delivery).await.unwrap();

    let record = service
        .complete_delivery(
            DELIVERY,
            CompletionRequest {
                operation_id: "op-complete".to_string(),
                notes: Some("left with concierge".to_string()),
                location: Some(sample_near(&clock, dropoff(), 0.0)),
                expected_version: None,
                courier_id: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(record.status, DeliveryStatus::Delivered);
    assert!(!record.is_live);
    assert_eq!(
        recorder.orders.lock().clone(),
        vec![(ORDER.to_string(), DeliveryStatus::Delivered)]
    );
    let changes = recorder.changes.lock();
    assert_eq!(changes.len(), 5);
    assert_eq!(changes.last().map(|c| c.to), Some(DeliveryStatus::Delivered));
}
