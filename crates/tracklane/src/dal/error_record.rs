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

//! Error record DAL.

use super::models::ErrorRecordRow;
use super::DAL;
use crate::database::schema::error_records;
use crate::error::StoreError;
use crate::models::error_record::{ErrorRecord, ErrorRecordStatus};
use diesel::prelude::*;

/// Data access layer for error records.
#[derive(Clone)]
pub struct ErrorRecordDAL<'a> {
    dal: &'a DAL,
}

impl<'a> ErrorRecordDAL<'a> {
    pub fn new(dal: &'a DAL) -> Self {
        Self { dal }
    }

    /// Inserts the record, replacing any previous version with the same id.
    pub async fn upsert(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        let row = ErrorRecordRow::from_record(record)?;
        let conn = self.dal.database.get_connection().await?;

        conn.interact(move |conn| {
            diesel::replace_into(error_records::table)
                .values(&row)
                .execute(conn)
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;
        Ok(())
    }

    /// The record tracking `operation_id`, if it has failed before.
    pub async fn get_by_operation(
        &self,
        operation_id: &str,
    ) -> Result<Option<ErrorRecord>, StoreError> {
        let operation_id = operation_id.to_string();
        let conn = self.dal.database.get_connection().await?;

        let row: Option<ErrorRecordRow> = conn
            .interact(move |conn| {
                error_records::table
                    .filter(error_records::operation_id.eq(operation_id))
                    .select(ErrorRecordRow::as_select())
                    .first(conn)
                    .optional()
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        row.map(ErrorRecordRow::into_record).transpose()
    }

    /// Records ordered oldest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<ErrorRecordStatus>,
    ) -> Result<Vec<ErrorRecord>, StoreError> {
        let conn = self.dal.database.get_connection().await?;

        let rows: Vec<ErrorRecordRow> = conn
            .interact(move |conn| {
                let mut query = error_records::table
                    .select(ErrorRecordRow::as_select())
                    .order(error_records::created_at.asc())
                    .into_boxed();
                if let Some(status) = status {
                    query = query.filter(error_records::status.eq(status.as_str()));
                }
                query.load(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        rows.into_iter().map(ErrorRecordRow::into_record).collect()
    }
}
