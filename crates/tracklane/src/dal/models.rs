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

//! Row types and their conversions to domain models.
//!
//! Timestamps are stored as RFC 3339 text and structured payloads as JSON.

use crate::database::schema::{entity_snapshots, error_records, pending_operations};
use crate::error::StoreError;
use crate::models::delivery::DeliveryTrackingRecord;
use crate::models::error_record::{ErrorRecord, ErrorRecordStatus, ErrorType, RecoveryStrategyKind};
use crate::models::operation::{OperationPayload, PendingOperation, Priority};
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(table: &'static str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| corrupt(table, format!("bad timestamp {:?}: {}", text, e)))
}

fn corrupt(table: &'static str, message: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        table,
        message: message.into(),
    }
}

fn to_i32(table: &'static str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| corrupt(table, format!("counter {} out of range", value)))
}

fn to_u32(table: &'static str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| corrupt(table, format!("negative counter {}", value)))
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = pending_operations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PendingOperationRow {
    pub operation_id: String,
    pub entity_id: String,
    pub operation_type: String,
    pub payload: String,
    pub retry_count: i32,
    pub priority: String,
    pub position: i64,
    pub created_at: String,
    pub not_before: Option<String>,
}

impl PendingOperationRow {
    const TABLE: &'static str = "pending_operations";

    pub fn from_operation(op: &PendingOperation, position: i64) -> Result<Self, StoreError> {
        Ok(Self {
            operation_id: op.operation_id.clone(),
            entity_id: op.entity_id.clone(),
            operation_type: op.op_type().as_str().to_string(),
            payload: serde_json::to_string(&op.payload)?,
            retry_count: to_i32(Self::TABLE, op.retry_count)?,
            priority: op.priority.as_str().to_string(),
            position,
            created_at: format_timestamp(op.created_at),
            not_before: op.not_before.map(format_timestamp),
        })
    }

    pub fn into_operation(self) -> Result<PendingOperation, StoreError> {
        let payload: OperationPayload = serde_json::from_str(&self.payload)?;
        if payload.op_type().as_str() != self.operation_type {
            return Err(corrupt(
                Self::TABLE,
                format!(
                    "operation {} is typed {} but carries a {} payload",
                    self.operation_id,
                    self.operation_type,
                    payload.op_type()
                ),
            ));
        }
        let priority = Priority::parse(&self.priority)
            .ok_or_else(|| corrupt(Self::TABLE, format!("unknown priority {}", self.priority)))?;
        Ok(PendingOperation {
            retry_count: to_u32(Self::TABLE, self.retry_count)?,
            created_at: parse_timestamp(Self::TABLE, &self.created_at)?,
            not_before: self
                .not_before
                .as_deref()
                .map(|ts| parse_timestamp(Self::TABLE, ts))
                .transpose()?,
            operation_id: self.operation_id,
            entity_id: self.entity_id,
            payload,
            priority,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = error_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ErrorRecordRow {
    pub id: String,
    pub error_type: String,
    pub operation_id: String,
    pub entity_id: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub strategy: String,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ErrorRecordRow {
    const TABLE: &'static str = "error_records";

    pub fn from_record(record: &ErrorRecord) -> Result<Self, StoreError> {
        Ok(Self {
            id: record.id.clone(),
            error_type: record.error_type.as_str().to_string(),
            operation_id: record.operation_id.clone(),
            entity_id: record.entity_id.clone(),
            retry_count: to_i32(Self::TABLE, record.retry_count)?,
            max_retries: to_i32(Self::TABLE, record.max_retries)?,
            strategy: record.strategy.as_str().to_string(),
            status: record.status.as_str().to_string(),
            last_error: record.last_error.clone(),
            created_at: format_timestamp(record.created_at),
            updated_at: format_timestamp(record.updated_at),
        })
    }

    pub fn into_record(self) -> Result<ErrorRecord, StoreError> {
        let error_type = ErrorType::parse(&self.error_type).ok_or_else(|| {
            corrupt(Self::TABLE, format!("unknown error type {}", self.error_type))
        })?;
        let strategy = RecoveryStrategyKind::parse(&self.strategy)
            .ok_or_else(|| corrupt(Self::TABLE, format!("unknown strategy {}", self.strategy)))?;
        let status = ErrorRecordStatus::parse(&self.status)
            .ok_or_else(|| corrupt(Self::TABLE, format!("unknown status {}", self.status)))?;
        Ok(ErrorRecord {
            retry_count: to_u32(Self::TABLE, self.retry_count)?,
            max_retries: to_u32(Self::TABLE, self.max_retries)?,
            created_at: parse_timestamp(Self::TABLE, &self.created_at)?,
            updated_at: parse_timestamp(Self::TABLE, &self.updated_at)?,
            id: self.id,
            error_type,
            operation_id: self.operation_id,
            entity_id: self.entity_id,
            strategy,
            status,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = entity_snapshots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EntitySnapshotRow {
    pub entity_id: String,
    pub record: String,
    pub updated_at: String,
}

impl EntitySnapshotRow {
    pub fn from_record(record: &DeliveryTrackingRecord) -> Result<Self, StoreError> {
        Ok(Self {
            entity_id: record.id.clone(),
            record: serde_json::to_string(record)?,
            updated_at: format_timestamp(record.updated_at),
        })
    }

    pub fn into_record(self) -> Result<DeliveryTrackingRecord, StoreError> {
        Ok(serde_json::from_str(&self.record)?)
    }
}
