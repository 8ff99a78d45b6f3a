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

//! End-to-end courier journeys through the client.

use crate::fixtures::{collect_events, dropoff, harness, pickup, sample_near, DELIVERY};
use tracklane::{ApiErrorCode, DeliveryStatus, Priority, QueueError, QueueEvent, SubmitOutcome};

fn rejection(err: QueueError) -> tracklane::ApiError {
    match err {
        QueueError::Rejected(api) => api,
        other => panic!("Expected a local rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_courier_journey_from_assignment_to_delivery() {
    let h = harness().await;
    let mut events = h.client.subscribe();

    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .expect("Failed to queue heading_to_pickup");
    h.drain_later().await;
    assert_eq!(h.status().await, DeliveryStatus::HeadingToPickup);

    // Too far from the restaurant to arrive
    let err = h
        .client
        .request_status_update(
            DELIVERY,
            DeliveryStatus::AtPickup,
            None,
            Some(sample_near(&h.clock, pickup(), 500.0)),
        )
        .await
        .unwrap_err();
    let api = rejection(err);
    assert_eq!(api.code, ApiErrorCode::TooFarFromDestination);
    let distance = api.distance_m.expect("Rejection should carry the distance");
    assert!((distance - 500.0).abs() < 1.0, "distance was {}", distance);
    assert_eq!(api.allowed_distance_m, Some(200.0));

    h.client
        .request_status_update(
            DELIVERY,
            DeliveryStatus::AtPickup,
            None,
            Some(sample_near(&h.clock, pickup(), 50.0)),
        )
        .await
        .expect("Failed to queue at_pickup");
    h.drain_later().await;
    assert_eq!(h.status().await, DeliveryStatus::AtPickup);

    // Only the merchant may hand the order over
    let err = h
        .client
        .request_status_update(DELIVERY, DeliveryStatus::PickedUp, None, None)
        .await
        .unwrap_err();
    assert_eq!(
        rejection(err).code,
        ApiErrorCode::WaitingMerchantConfirmation
    );
    h.service
        .confirm_pickup(DELIVERY, "merchant-confirm-1")
        .await
        .expect("Merchant confirmation failed");

    // The local snapshot still says at_pickup; the client re-reads before
    // turning the request away
    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToDelivery, None, None)
        .await
        .expect("Failed to queue heading_to_delivery");
    h.drain_later().await;
    assert_eq!(h.status().await, DeliveryStatus::HeadingToDelivery);

    // Two near-identical fixes a second apart travel as one update
    let first = sample_near(&h.clock, dropoff(), 800.0);
    h.clock.advance(chrono::Duration::seconds(1));
    let second = sample_near(&h.clock, dropoff(), 797.0);
    assert_eq!(
        h.client
            .submit_location(DELIVERY, first, Priority::Normal)
            .await
            .unwrap(),
        SubmitOutcome::Buffered
    );
    assert_eq!(
        h.client
            .submit_location(DELIVERY, second.clone(), Priority::Normal)
            .await
            .unwrap(),
        SubmitOutcome::Superseded
    );
    assert_eq!(h.client.batcher().flush().await.unwrap(), 1);
    h.drain_later().await;
    let record = h.service.get(DELIVERY).unwrap();
    assert_eq!(record.current_location, Some(second));
    // The arrival fix plus the one coalesced sample
    assert_eq!(record.location_history.len(), 2);

    h.client
        .request_status_update(
            DELIVERY,
            DeliveryStatus::AtDelivery,
            None,
            Some(sample_near(&h.clock, dropoff(), 30.0)),
        )
        .await
        .expect("Failed to queue at_delivery");
    h.drain_later().await;

    h.client
        .request_completion(
            DELIVERY,
            Some("left with concierge".to_string()),
            Some(sample_near(&h.clock, dropoff(), 5.0)),
        )
        .await
        .expect("Failed to queue completion");
    h.drain_later().await;

    let record = h.service.get(DELIVERY).unwrap();
    assert_eq!(record.status, DeliveryStatus::Delivered);
    assert_eq!(record.version, 6);
    assert!(!record.is_live);

    let seen = collect_events(&mut events);
    let confirmed = seen
        .iter()
        .filter(|event| matches!(event, QueueEvent::Succeeded { .. }))
        .count();
    assert_eq!(confirmed, 6);
    assert!(seen.iter().any(|event| matches!(
        event,
        QueueEvent::EntityClosed {
            status: DeliveryStatus::Delivered,
            ..
        }
    )));
    assert!(!seen
        .iter()
        .any(|event| matches!(event, QueueEvent::Failed { .. })));

    // Nothing further can be queued for a delivered order
    let err = h
        .client
        .request_status_update(DELIVERY, DeliveryStatus::Cancelled, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::DeliveryCompleted { .. }));

    let snapshot = h.client.monitoring_snapshot();
    assert_eq!(snapshot.total_operations, 6);
    assert_eq!(snapshot.total_failures, 0);
    assert!(snapshot.healthy);
}

/// Status requests are checked against what the queue will have done, not
/// just against the last confirmed record.
#[tokio::test]
async fn test_requests_are_checked_against_queued_status() {
    let h = harness().await;

    let queued = h
        .client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    // Asking again for a status that is already on its way is a no-op
    let again = h
        .client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .expect("Repeating a queued status succeeds");
    assert_eq!(again, queued);
    assert_eq!(h.client.pending().await.unwrap().len(), 1);

    h.client
        .request_status_update(
            DELIVERY,
            DeliveryStatus::AtPickup,
            None,
            Some(sample_near(&h.clock, pickup(), 20.0)),
        )
        .await
        .expect("at_pickup follows the queued heading_to_pickup");
    assert_eq!(h.client.pending().await.unwrap().len(), 2);

    // Only the last queued status counts; going back is still rejected
    let err = h
        .client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap_err();
    assert_eq!(rejection(err).code, ApiErrorCode::InvalidStatusTransition);

    // One head per delivery per batch keeps them in order
    h.drain_later().await;
    assert_eq!(h.status().await, DeliveryStatus::HeadingToPickup);
    h.drain_later().await;
    assert_eq!(h.status().await, DeliveryStatus::AtPickup);
    assert!(h.client.pending().await.unwrap().is_empty());
}
