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

//! Pending Operation Model
//!
//! A [`PendingOperation`] is the client's durable record of an intended
//! mutation. It is persisted the moment a caller asks for the mutation and
//! removed only on confirmed success, no-op resolution, or retry exhaustion.

use super::delivery::{DeliveryStatus, LocationSample};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    LocationUpdate,
    StatusUpdate,
    DeliveryCompletion,
}

impl OperationType {
    pub const ALL: [OperationType; 3] = [
        OperationType::LocationUpdate,
        OperationType::StatusUpdate,
        OperationType::DeliveryCompletion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::LocationUpdate => "location_update",
            OperationType::StatusUpdate => "status_update",
            OperationType::DeliveryCompletion => "delivery_completion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        OperationType::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-assigned urgency of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

/// The mutation carried by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationPayload {
    Location {
        sample: LocationSample,
    },
    Status {
        status: DeliveryStatus,
        notes: Option<String>,
        location: Option<LocationSample>,
    },
    Completion {
        notes: Option<String>,
        location: Option<LocationSample>,
    },
}

impl OperationPayload {
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationPayload::Location { .. } => OperationType::LocationUpdate,
            OperationPayload::Status { .. } => OperationType::StatusUpdate,
            OperationPayload::Completion { .. } => OperationType::DeliveryCompletion,
        }
    }

    /// The status this operation drives the delivery towards, if any.
    pub fn target_status(&self) -> Option<DeliveryStatus> {
        match self {
            OperationPayload::Location { .. } => None,
            OperationPayload::Status { status, .. } => Some(*status),
            OperationPayload::Completion { .. } => Some(DeliveryStatus::Delivered),
        }
    }
}

/// A durable, client-held mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Caller-generated, globally unique id; doubles as the server idempotency key
    pub operation_id: String,
    /// The delivery this operation mutates
    pub entity_id: String,
    pub payload: OperationPayload,
    pub retry_count: u32,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    /// Earliest time the next attempt may run; `None` means immediately
    pub not_before: Option<DateTime<Utc>>,
}

impl PendingOperation {
    pub fn new(
        entity_id: impl Into<String>,
        payload: OperationPayload,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            payload,
            retry_count: 0,
            priority,
            created_at: now,
            not_before: None,
        }
    }

    pub fn location_update(
        entity_id: impl Into<String>,
        sample: LocationSample,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(entity_id, OperationPayload::Location { sample }, priority, now)
    }

    pub fn status_update(
        entity_id: impl Into<String>,
        status: DeliveryStatus,
        notes: Option<String>,
        location: Option<LocationSample>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            entity_id,
            OperationPayload::Status {
                status,
                notes,
                location,
            },
            Priority::High,
            now,
        )
    }

    pub fn delivery_completion(
        entity_id: impl Into<String>,
        notes: Option<String>,
        location: Option<LocationSample>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(
            entity_id,
            OperationPayload::Completion { notes, location },
            Priority::High,
            now,
        )
    }

    pub fn op_type(&self) -> OperationType {
        self.payload.op_type()
    }

    /// Whether the operation may run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}
