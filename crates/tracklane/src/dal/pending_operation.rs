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

//! Pending operation DAL.
//!
//! The queue is ordered by a signed `position`. New operations go below the
//! tail (`max + 1`); retried operations go above the head (`min - 1`) so they
//! run before anything that was waiting behind them. Every mutation is a
//! single SQLite transaction.

use super::models::{EntitySnapshotRow, ErrorRecordRow, PendingOperationRow};
use super::DAL;
use crate::database::schema::{entity_snapshots, error_records, pending_operations};
use crate::error::StoreError;
use crate::models::delivery::DeliveryTrackingRecord;
use crate::models::error_record::{ErrorRecord, ErrorRecordStatus};
use crate::models::operation::PendingOperation;
use diesel::dsl::{max, min};
use diesel::prelude::*;
use diesel::SqliteConnection;

/// Data access layer for the durable operation queue.
#[derive(Clone)]
pub struct PendingOperationDAL<'a> {
    dal: &'a DAL,
}

impl<'a> PendingOperationDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Appends an operation at the tail of the queue.
    ///
    /// Persisting an operation id that is already queued is a no-op, so a
    /// caller replaying its own intent after a crash cannot duplicate it.
    /// Returns whether a row was inserted.
    pub async fn enqueue(&self, op: &PendingOperation) -> Result<bool, StoreError> {
        let op = op.clone();
        let conn = self.dal.database.get_connection().await?;

        conn.interact(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let exists = pending_operations::table
                    .find(&op.operation_id)
                    .count()
                    .get_result::<i64>(conn)?
                    > 0;
                if exists {
                    return Ok(false);
                }

                let tail: Option<i64> = pending_operations::table
                    .select(max(pending_operations::position))
                    .first(conn)?;
                let row = PendingOperationRow::from_operation(&op, tail.map_or(0, |p| p + 1))?;
                diesel::insert_into(pending_operations::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(true)
            })
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
    }

    /// Every queued operation in processing order.
    pub async fn list(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let conn = self.dal.database.get_connection().await?;

        let rows: Vec<PendingOperationRow> = conn
            .interact(|conn| {
                pending_operations::table
                    .order(pending_operations::position.asc())
                    .select(PendingOperationRow::as_select())
                    .load(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        rows.into_iter().map(PendingOperationRow::into_operation).collect()
    }

    /// Queued operations for one delivery, in processing order.
    pub async fn list_for_entity(
        &self,
        entity_id: &str,
    ) -> Result<Vec<PendingOperation>, StoreError> {
        let entity_id = entity_id.to_string();
        let conn = self.dal.database.get_connection().await?;

        let rows: Vec<PendingOperationRow> = conn
            .interact(move |conn| {
                pending_operations::table
                    .filter(pending_operations::entity_id.eq(entity_id))
                    .order(pending_operations::position.asc())
                    .select(PendingOperationRow::as_select())
                    .load(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        rows.into_iter().map(PendingOperationRow::into_operation).collect()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let conn = self.dal.database.get_connection().await?;

        let count = conn
            .interact(|conn| pending_operations::table.count().get_result::<i64>(conn))
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;
        Ok(count)
    }

    /// Drops every queued operation for a delivery and their pending error
    /// records. Returns the number of operations removed.
    pub async fn purge_entity(&self, entity_id: &str) -> Result<usize, StoreError> {
        let entity_id = entity_id.to_string();
        let conn = self.dal.database.get_connection().await?;

        conn.interact(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| purge_entity_rows(conn, &entity_id))
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
    }

    /// Settles a confirmed operation: removes it and its error record, and
    /// stores the refreshed snapshot if one is given.
    pub async fn complete(
        &self,
        operation_id: &str,
        snapshot: Option<DeliveryTrackingRecord>,
    ) -> Result<(), StoreError> {
        let operation_id = operation_id.to_string();
        let snapshot = snapshot.as_ref().map(EntitySnapshotRow::from_record).transpose()?;
        let conn = self.dal.database.get_connection().await?;

        conn.interact(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                diesel::delete(pending_operations::table.find(&operation_id)).execute(conn)?;
                diesel::delete(
                    error_records::table.filter(error_records::operation_id.eq(&operation_id)),
                )
                .execute(conn)?;
                if let Some(row) = &snapshot {
                    diesel::replace_into(entity_snapshots::table)
                        .values(row)
                        .execute(conn)?;
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
    }

    /// Puts a failed operation back at the head of the queue and records the
    /// failure, atomically.
    pub async fn requeue_front(
        &self,
        op: &PendingOperation,
        error: &ErrorRecord,
    ) -> Result<(), StoreError> {
        let op = op.clone();
        let error = ErrorRecordRow::from_record(error)?;
        let conn = self.dal.database.get_connection().await?;

        conn.interact(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                diesel::delete(pending_operations::table.find(&op.operation_id)).execute(conn)?;
                let head: Option<i64> = pending_operations::table
                    .select(min(pending_operations::position))
                    .first(conn)?;
                let row = PendingOperationRow::from_operation(&op, head.map_or(0, |p| p - 1))?;
                diesel::insert_into(pending_operations::table)
                    .values(&row)
                    .execute(conn)?;
                diesel::replace_into(error_records::table)
                    .values(&error)
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
    }

    /// Removes an operation for good and stores its final error record.
    pub async fn settle_with_error(
        &self,
        operation_id: &str,
        error: &ErrorRecord,
    ) -> Result<(), StoreError> {
        let operation_id = operation_id.to_string();
        let error = ErrorRecordRow::from_record(error)?;
        let conn = self.dal.database.get_connection().await?;

        conn.interact(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                diesel::delete(pending_operations::table.find(&operation_id)).execute(conn)?;
                diesel::replace_into(error_records::table)
                    .values(&error)
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
    }

    /// Closes a delivery that reached a terminal status: drops its queued
    /// operations and pending error records, and stores the final snapshot.
    /// Returns the number of operations dropped.
    pub async fn close_entity(
        &self,
        snapshot: &DeliveryTrackingRecord,
    ) -> Result<usize, StoreError> {
        let entity_id = snapshot.id.clone();
        let row = EntitySnapshotRow::from_record(snapshot)?;
        let conn = self.dal.database.get_connection().await?;

        conn.interact(move |conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let dropped = purge_entity_rows(conn, &entity_id)?;
                diesel::replace_into(entity_snapshots::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(dropped)
            })
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))?
    }
}

fn purge_entity_rows(conn: &mut SqliteConnection, entity_id: &str) -> Result<usize, StoreError> {
    let dropped = diesel::delete(
        pending_operations::table.filter(pending_operations::entity_id.eq(entity_id)),
    )
    .execute(conn)?;
    diesel::delete(
        error_records::table
            .filter(error_records::entity_id.eq(entity_id))
            .filter(error_records::status.eq(ErrorRecordStatus::Pending.as_str())),
    )
    .execute(conn)?;
    Ok(dropped)
}
