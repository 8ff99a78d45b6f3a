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

use crate::fixtures::{
    collect_events, harness, harness_with, pickup, sample_near, COURIER, DELIVERY,
};
use serial_test::serial;
use std::time::Duration;
use tracklane::recovery::Applicability;
use tracklane::transport::StatusUpdateRequest;
use tracklane::{
    BatchReport, DeliveryStatus, ErrorRecordStatus, ErrorType, Priority, QueueError, QueueEvent,
    SubmitOutcome, TransportError,
};

/// Server errors are retried with backoff and give up after the fourth
/// attempt, leaving a failed error record and a user-facing failure event.
#[tokio::test]
async fn test_server_errors_exhaust_retry_budget() {
    let h = harness().await;
    let mut events = h.client.subscribe();
    h.transport.fail_next(
        TransportError::Server {
            status: 503,
            message: "unavailable".to_string(),
        },
        4,
    );

    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .expect("Failed to queue status update");

    let mut retried = 0;
    let mut failed = 0;
    for _ in 0..4 {
        let summary = h.drain_later().await.summary().expect("Batch should run");
        retried += summary.retried;
        failed += summary.failed;
    }
    assert_eq!(retried, 3);
    assert_eq!(failed, 1);
    assert_eq!(h.transport.calls(), 4);
    assert!(h.client.pending().await.unwrap().is_empty());
    assert_eq!(h.status().await, DeliveryStatus::Assigned);

    let records = h
        .client
        .error_records(Some(ErrorRecordStatus::Failed))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].error_type, ErrorType::ServerError);
    assert_eq!(records[0].retry_count, 3);
    assert_eq!(records[0].max_retries, 3);

    let failure = collect_events(&mut events)
        .into_iter()
        .find_map(|event| match event {
            QueueEvent::Failed {
                message,
                suggested_action,
                ..
            } => Some((message, suggested_action)),
            _ => None,
        })
        .expect("A failure event should be emitted");
    assert_eq!(failure.0, ErrorType::ServerError.user_message());
    assert_eq!(failure.1, "Try again");
}

/// A stale snapshot produces a version conflict; the queue refreshes,
/// finds the operation still applicable and succeeds on the next batch.
#[tokio::test]
async fn test_version_conflict_refreshes_and_retries() {
    let h = harness().await;
    let mut events = h.client.subscribe();
    h.client.refresh(DELIVERY).await.expect("Failed to refresh");

    // Someone else moves the delivery on behind the client's back
    h.service
        .update_status(
            DELIVERY,
            StatusUpdateRequest {
                operation_id: "elsewhere-1".to_string(),
                status: DeliveryStatus::HeadingToPickup,
                notes: None,
                location: None,
                expected_version: None,
                courier_id: Some(COURIER.to_string()),
            },
        )
        .await
        .expect("Failed to update on the service");

    h.client
        .request_status_update(DELIVERY, DeliveryStatus::Cancelled, None, None)
        .await
        .expect("Cancelling from the stale snapshot is allowed locally");

    let first = h.drain_later().await.summary().unwrap();
    assert_eq!(first.retried, 1);
    let retry = collect_events(&mut events)
        .into_iter()
        .find_map(|event| match event {
            QueueEvent::RetryScheduled {
                error_type,
                retry_count,
                delay,
                ..
            } => Some((error_type, retry_count, delay)),
            _ => None,
        })
        .expect("A retry should be scheduled");
    assert_eq!(retry, (ErrorType::VersionConflict, 1, Duration::ZERO));

    let second = h.drain_later().await.summary().unwrap();
    assert_eq!(second.succeeded, 1);
    assert_eq!(h.status().await, DeliveryStatus::Cancelled);
    assert!(collect_events(&mut events).iter().any(|event| matches!(
        event,
        QueueEvent::EntityClosed {
            status: DeliveryStatus::Cancelled,
            ..
        }
    )));

    // Resolved retries leave no diagnostic records behind
    assert!(h.client.error_records(None).await.unwrap().is_empty());
    assert!(h.client.pending().await.unwrap().is_empty());

    let err = h
        .client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::DeliveryCompleted {
            status: DeliveryStatus::Cancelled,
            ..
        }
    ));

    let late_sample = sample_near(&h.clock, pickup(), 10.0);
    let outcome = h
        .client
        .submit_location(DELIVERY, late_sample, Priority::High)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Flushed { queued: 0 });
}

/// An operation the service already applied is settled as a no-op rather
/// than retried or reported as a failure.
#[tokio::test]
async fn test_already_applied_operation_resolves_as_noop() {
    let h = harness().await;
    let mut events = h.client.subscribe();

    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    h.service
        .update_status(
            DELIVERY,
            StatusUpdateRequest {
                operation_id: "elsewhere-1".to_string(),
                status: DeliveryStatus::HeadingToPickup,
                notes: None,
                location: None,
                expected_version: None,
                courier_id: Some(COURIER.to_string()),
            },
        )
        .await
        .unwrap();

    let summary = h.drain_later().await.summary().unwrap();
    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.failed, 0);
    assert!(collect_events(&mut events).iter().any(|event| matches!(
        event,
        QueueEvent::ResolvedNoOp {
            error_type: ErrorType::InvalidTransition,
            outcome: Applicability::AlreadyApplied,
            ..
        }
    )));
    assert!(h.client.pending().await.unwrap().is_empty());
    assert!(h.client.error_records(None).await.unwrap().is_empty());
    assert_eq!(h.service.get(DELIVERY).unwrap().version, 1);
}

/// Two devices submitting the same transition at once: exactly one applies
/// it, the other is turned away by the entity lock and later settles as a
/// no-op.
#[tokio::test]
#[serial]
async fn test_competing_clients_apply_once() {
    let h = harness_with(Duration::from_millis(300), |b| b).await;
    let (_peer_dir, peer) = h.peer_client().await;

    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    peer.request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();

    let (a, b) = tokio::join!(h.client.drain(), peer.drain());
    let a = a.unwrap().summary().unwrap();
    let b = b.unwrap().summary().unwrap();
    assert_eq!(a.succeeded + b.succeeded, 1);
    assert_eq!(a.failed + b.failed, 0);

    // Let the loser's backoff elapse and settle it
    h.drain_later().await;
    peer.drain().await.unwrap();

    assert!(h.client.pending().await.unwrap().is_empty());
    assert!(peer.pending().await.unwrap().is_empty());
    let record = h.service.get(DELIVERY).unwrap();
    assert_eq!(record.status, DeliveryStatus::HeadingToPickup);
    assert_eq!(record.version, 1);
    assert!(record.lock.operation_lock.is_none());
}

/// Offline, nothing is sent; coming back online drains the queue without
/// any explicit call.
#[tokio::test]
#[serial]
async fn test_reconnect_drains_queue() {
    let h = harness().await;
    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();

    h.connectivity.set_online(false);
    assert_eq!(h.client.drain().await.unwrap(), BatchReport::Paused);
    assert_eq!(h.transport.calls(), 0);

    let mut events = h.client.subscribe();
    h.client.start();
    h.connectivity.set_online(true);

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Succeeded { status, .. }) => break status,
                Ok(_) => continue,
                Err(e) => panic!("Event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("Queue should drain after reconnecting");
    h.client.shutdown().await;

    assert_eq!(status, DeliveryStatus::HeadingToPickup);
    assert_eq!(h.status().await, DeliveryStatus::HeadingToPickup);
}

/// Batches are spaced by the minimum flush interval.
#[tokio::test]
async fn test_batches_respect_min_flush_interval() {
    let h = harness().await;
    h.add_delivery("delivery-2");

    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    assert!(matches!(h.client.drain().await.unwrap(), BatchReport::Processed(_)));

    h.client
        .request_status_update("delivery-2", DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    assert_eq!(
        h.client.drain().await.unwrap(),
        BatchReport::Deferred {
            retry_in: Duration::from_secs(5)
        }
    );

    h.clock.advance(chrono::Duration::seconds(5));
    let summary = h.client.drain().await.unwrap().summary().unwrap();
    assert_eq!(summary.succeeded, 1);
}

/// A batch takes at most `batch_size` operations, and a delivery closed on
/// the service is settled without holding back the others.
#[tokio::test]
async fn test_batch_outcomes_are_independent() {
    let h = harness().await;
    for id in ["delivery-2", "delivery-3", "delivery-4"] {
        h.add_delivery(id);
    }
    // The client does not know delivery-2 is gone
    h.service
        .update_status(
            "delivery-2",
            StatusUpdateRequest {
                operation_id: "dispatch-cancel".to_string(),
                status: DeliveryStatus::Cancelled,
                notes: None,
                location: None,
                expected_version: None,
                courier_id: None,
            },
        )
        .await
        .unwrap();

    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    h.client
        .submit_location(
            "delivery-2",
            sample_near(&h.clock, pickup(), 100.0),
            Priority::High,
        )
        .await
        .unwrap();
    for id in ["delivery-3", "delivery-4"] {
        h.client
            .request_status_update(id, DeliveryStatus::HeadingToPickup, None, None)
            .await
            .unwrap();
    }
    assert_eq!(h.client.pending().await.unwrap().len(), 4);

    let summary = h.client.drain().await.unwrap().summary().unwrap();
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.failed, 0);

    let left = h.client.pending().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].entity_id, "delivery-4");

    let closed = h.client.snapshot("delivery-2").await.unwrap().unwrap();
    assert_eq!(closed.status, DeliveryStatus::Cancelled);
    assert!(h.client.error_records(None).await.unwrap().is_empty());
}

/// A delivery cancelled on the service is closed locally by the first
/// rejected sample, and no failure reaches the user.
#[tokio::test]
async fn test_delivery_cancelled_on_service_is_closed_locally() {
    let h = harness().await;
    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    assert_eq!(h.drain_later().await.summary().unwrap().succeeded, 1);

    h.service
        .update_status(
            DELIVERY,
            StatusUpdateRequest {
                operation_id: "dispatch-cancel".to_string(),
                status: DeliveryStatus::Cancelled,
                notes: None,
                location: None,
                expected_version: None,
                courier_id: None,
            },
        )
        .await
        .unwrap();

    let mut events = h.client.subscribe();
    let outcome = h
        .client
        .submit_location(DELIVERY, sample_near(&h.clock, pickup(), 200.0), Priority::High)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Flushed { queued: 1 });

    let summary = h.drain_later().await.summary().unwrap();
    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.failed, 0);

    let events = collect_events(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        QueueEvent::ResolvedNoOp {
            outcome: Applicability::NoLongerApplicable,
            ..
        }
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        QueueEvent::EntityClosed {
            status: DeliveryStatus::Cancelled,
            ..
        }
    )));
    assert!(!events
        .iter()
        .any(|event| matches!(event, QueueEvent::Failed { .. })));
    assert!(h.client.error_records(None).await.unwrap().is_empty());

    let snapshot = h.client.snapshot(DELIVERY).await.unwrap().unwrap();
    assert_eq!(snapshot.status, DeliveryStatus::Cancelled);

    // Later samples and requests are refused before anything is queued
    let outcome = h
        .client
        .submit_location(DELIVERY, sample_near(&h.clock, pickup(), 400.0), Priority::High)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Flushed { queued: 0 });
    let err = h
        .client
        .request_status_update(DELIVERY, DeliveryStatus::AtPickup, None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueueError::DeliveryCompleted {
            status: DeliveryStatus::Cancelled,
            ..
        }
    ));
    assert!(h.client.pending().await.unwrap().is_empty());
}

/// Stepping the clock backwards defers the next batch for one interval
/// at most.
#[tokio::test]
async fn test_backwards_clock_step_does_not_stall_batches() {
    use tracklane::Clock;

    let h = harness().await;
    h.add_delivery("delivery-2");

    h.client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    assert!(matches!(h.client.drain().await.unwrap(), BatchReport::Processed(_)));

    h.clock.set(h.clock.now() - chrono::Duration::hours(1));
    h.client
        .request_status_update("delivery-2", DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();
    assert_eq!(
        h.client.drain().await.unwrap(),
        BatchReport::Deferred {
            retry_in: Duration::from_secs(5)
        }
    );

    h.clock.advance(chrono::Duration::seconds(5));
    let summary = h.client.drain().await.unwrap().summary().unwrap();
    assert_eq!(summary.succeeded, 1);
}

/// Queued operations are durable: a new client on the same store picks
/// them up.
#[tokio::test]
async fn test_pending_operations_survive_restart() {
    let h = harness().await;
    h.connectivity.set_online(false);
    let operation_id = h
        .client
        .request_status_update(DELIVERY, DeliveryStatus::HeadingToPickup, None, None)
        .await
        .unwrap();

    let reopened = h.reopen_client().await;
    let pending = reopened.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation_id, operation_id);

    h.connectivity.set_online(true);
    let summary = reopened.drain().await.unwrap().summary().unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.status().await, DeliveryStatus::HeadingToPickup);
}
