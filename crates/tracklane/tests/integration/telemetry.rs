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

use crate::fixtures::{dropoff, harness, harness_with, pickup, sample_near, DELIVERY};
use serial_test::serial;
use std::time::Duration;
use tracklane::{OperationPayload, OperationType, Priority, SubmitOutcome};

fn queued_sample(op: &tracklane::PendingOperation) -> &tracklane::LocationSample {
    match &op.payload {
        OperationPayload::Location { sample } => sample,
        other => panic!("Expected a location update, got {:?}", other),
    }
}

#[tokio::test]
async fn test_near_duplicate_samples_queue_once() {
    let h = harness().await;
    let first = sample_near(&h.clock, pickup(), 300.0);
    h.clock.advance(chrono::Duration::seconds(1));
    let second = sample_near(&h.clock, pickup(), 303.0);

    let client = &h.client;
    assert_eq!(
        client.submit_location(DELIVERY, first, Priority::Normal).await.unwrap(),
        SubmitOutcome::Buffered
    );
    assert_eq!(
        client
            .submit_location(DELIVERY, second.clone(), Priority::Normal)
            .await
            .unwrap(),
        SubmitOutcome::Superseded
    );
    assert_eq!(client.batcher().buffered(), 1);
    assert_eq!(client.batcher().buffered_sample(DELIVERY), Some(second.clone()));

    assert_eq!(client.batcher().flush().await.unwrap(), 1);
    let pending = client.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].op_type(), OperationType::LocationUpdate);
    assert_eq!(queued_sample(&pending[0]), &second);

    // Once flushed, a repeat of the same fix is dropped outright
    let repeat = sample_near(&h.clock, pickup(), 303.0);
    assert_eq!(
        client.submit_location(DELIVERY, repeat, Priority::Normal).await.unwrap(),
        SubmitOutcome::Discarded
    );
    assert_eq!(client.batcher().buffered(), 0);
}

#[tokio::test]
async fn test_high_priority_sample_flushes_immediately() {
    let h = harness().await;
    h.client
        .submit_location(DELIVERY, sample_near(&h.clock, pickup(), 900.0), Priority::Normal)
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::seconds(10));
    let urgent = sample_near(&h.clock, pickup(), 600.0);
    let outcome = h
        .client
        .submit_location(DELIVERY, urgent.clone(), Priority::High)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Flushed { queued: 1 });
    assert_eq!(h.client.batcher().buffered(), 0);

    let pending = h.client.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, Priority::High);
    assert_eq!(queued_sample(&pending[0]), &urgent);
}

#[tokio::test]
#[serial]
async fn test_buffered_samples_flush_after_debounce() {
    let h = harness_with(Duration::ZERO, |b| b.debounce(Duration::from_millis(100))).await;
    h.add_delivery("delivery-2");

    h.client
        .submit_location(DELIVERY, sample_near(&h.clock, pickup(), 400.0), Priority::Normal)
        .await
        .unwrap();
    h.client
        .submit_location("delivery-2", sample_near(&h.clock, dropoff(), 400.0), Priority::Normal)
        .await
        .unwrap();
    assert_eq!(h.client.batcher().buffered(), 2);

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(h.client.batcher().buffered(), 0);
    let pending = h.client.pending().await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending
        .iter()
        .all(|op| op.op_type() == OperationType::LocationUpdate));

    let summary = h.drain_later().await.summary().unwrap();
    assert_eq!(summary.succeeded, 2);
    assert!(h.service.get("delivery-2").unwrap().current_location.is_some());
}
