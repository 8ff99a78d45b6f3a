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

//! Entity snapshot DAL.
//!
//! Snapshots are the client's last known copy of a delivery record. They are
//! a local projection used for pre-checks and conflict resolution, never a
//! second source of truth.

use super::models::EntitySnapshotRow;
use super::DAL;
use crate::database::schema::entity_snapshots;
use crate::error::StoreError;
use crate::models::delivery::DeliveryTrackingRecord;
use diesel::prelude::*;

/// Data access layer for delivery snapshots.
#[derive(Clone)]
pub struct EntitySnapshotDAL<'a> {
    dal: &'a DAL,
}

impl<'a> EntitySnapshotDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    pub async fn save(&self, record: &DeliveryTrackingRecord) -> Result<(), StoreError> {
        let row = EntitySnapshotRow::from_record(record)?;
        let conn = self.dal.database.get_connection().await?;

        conn.interact(move |conn| {
            diesel::replace_into(entity_snapshots::table)
                .values(&row)
                .execute(conn)
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;
        Ok(())
    }

    pub async fn get(&self, entity_id: &str) -> Result<Option<DeliveryTrackingRecord>, StoreError> {
        let entity_id = entity_id.to_string();
        let conn = self.dal.database.get_connection().await?;

        let row: Option<EntitySnapshotRow> = conn
            .interact(move |conn| {
                entity_snapshots::table
                    .find(entity_id)
                    .select(EntitySnapshotRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        row.map(EntitySnapshotRow::into_record).transpose()
    }

    pub async fn list(&self) -> Result<Vec<DeliveryTrackingRecord>, StoreError> {
        let conn = self.dal.database.get_connection().await?;

        let rows: Vec<EntitySnapshotRow> = conn
            .interact(|conn| {
                entity_snapshots::table
                    .order(entity_snapshots::entity_id.asc())
                    .select(EntitySnapshotRow::as_select())
                    .load(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        rows.into_iter().map(EntitySnapshotRow::into_record).collect()
    }

    pub async fn delete(&self, entity_id: &str) -> Result<bool, StoreError> {
        let entity_id = entity_id.to_string();
        let conn = self.dal.database.get_connection().await?;

        let deleted = conn
            .interact(move |conn| {
                diesel::delete(entity_snapshots::table.find(entity_id)).execute(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;
        Ok(deleted > 0)
    }
}
