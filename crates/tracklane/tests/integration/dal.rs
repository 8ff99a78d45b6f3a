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

use crate::fixtures::{dropoff, pickup, COURIER};
use chrono::Utc;
use tempfile::TempDir;
use tracklane::dal::DAL;
use tracklane::models::error_record::RecoveryStrategyKind;
use tracklane::{
    Database, DeliveryStatus, DeliveryTrackingRecord, ErrorRecord, ErrorRecordStatus, ErrorType,
    PendingOperation,
};

async fn store() -> (TempDir, DAL) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = dir.path().join("dal.db").display().to_string();
    let database = Database::new(&url).expect("Failed to open database");
    database
        .run_migrations()
        .await
        .expect("Failed to run migrations");
    (dir, DAL::new(database))
}

fn status_op(entity_id: &str) -> PendingOperation {
    PendingOperation::status_update(
        entity_id,
        DeliveryStatus::HeadingToPickup,
        None,
        None,
        Utc::now(),
    )
}

fn pending_error(op: &PendingOperation) -> ErrorRecord {
    ErrorRecord::new(
        &op.operation_id,
        &op.entity_id,
        ErrorType::ParallelWriteConflict,
        5,
        RecoveryStrategyKind::Backoff,
        Some("locked".to_string()),
        Utc::now(),
    )
}

#[tokio::test]
async fn test_enqueue_ignores_known_operation_ids() {
    let (_dir, dal) = store().await;
    let op = status_op("d-1");

    assert!(dal.pending_operations().enqueue(&op).await.unwrap());
    assert!(!dal.pending_operations().enqueue(&op).await.unwrap());
    assert_eq!(dal.pending_operations().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_requeue_front_moves_operation_ahead() {
    let (_dir, dal) = store().await;
    let first = status_op("d-1");
    let mut retried = status_op("d-2");
    dal.pending_operations().enqueue(&first).await.unwrap();
    dal.pending_operations().enqueue(&retried).await.unwrap();

    retried.retry_count = 1;
    let mut error = pending_error(&retried);
    error.retry_count = 1;
    dal.pending_operations()
        .requeue_front(&retried, &error)
        .await
        .unwrap();

    let order: Vec<_> = dal
        .pending_operations()
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|op| (op.operation_id, op.retry_count))
        .collect();
    assert_eq!(
        order,
        vec![
            (retried.operation_id.clone(), 1),
            (first.operation_id.clone(), 0)
        ]
    );

    let stored = dal
        .error_records()
        .get_by_operation(&retried.operation_id)
        .await
        .unwrap()
        .expect("Error record should be stored");
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.status, ErrorRecordStatus::Pending);
}

#[tokio::test]
async fn test_close_entity_clears_only_that_delivery() {
    let (_dir, dal) = store().await;
    let a1 = status_op("d-1");
    let a2 = status_op("d-1");
    let other = status_op("d-2");
    for op in [&a1, &a2, &other] {
        dal.pending_operations().enqueue(op).await.unwrap();
    }
    dal.pending_operations()
        .requeue_front(&a1, &pending_error(&a1))
        .await
        .unwrap();

    let mut failed = pending_error(&a2);
    failed.status = ErrorRecordStatus::Failed;
    dal.error_records().upsert(&failed).await.unwrap();

    let mut record =
        DeliveryTrackingRecord::new("d-1", "o-1", pickup(), dropoff(), 10, Utc::now());
    record.courier_id = Some(COURIER.to_string());
    record.status = DeliveryStatus::Delivered;
    let dropped = dal.pending_operations().close_entity(&record).await.unwrap();
    assert_eq!(dropped, 2);

    let left = dal.pending_operations().list().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].operation_id, other.operation_id);

    // Failed records stay for diagnosis; pending ones go with their operation
    let records = dal.error_records().list(None).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ErrorRecordStatus::Failed);

    let snapshot = dal
        .entity_snapshots()
        .get("d-1")
        .await
        .unwrap()
        .expect("Final snapshot should be stored");
    assert!(snapshot.is_terminal());
}
