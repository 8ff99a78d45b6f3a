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

//! Data access layer for the durable client store.
//!
//! Each table gets a borrowing accessor (`PendingOperationDAL<'a>` and
//! friends). Operations that change more than one table, such as removing a
//! confirmed operation together with its error record and the refreshed
//! snapshot, run in one SQLite transaction so a crash cannot leave the
//! queue half-updated.

pub mod entity_snapshot;
pub mod error_record;
pub mod models;
pub mod pending_operation;

pub use entity_snapshot::EntitySnapshotDAL;
pub use error_record::ErrorRecordDAL;
pub use pending_operation::PendingOperationDAL;

use crate::database::Database;

/// Entry point to the table accessors.
#[derive(Clone, Debug)]
pub struct DAL {
    pub database: Database,
}

impl DAL {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub fn pending_operations(&self) -> PendingOperationDAL<'_> {
        PendingOperationDAL::new(self)
    }

    pub fn error_records(&self) -> ErrorRecordDAL<'_> {
        ErrorRecordDAL::new(self)
    }

    pub fn entity_snapshots(&self) -> EntitySnapshotDAL<'_> {
        EntitySnapshotDAL::new(self)
    }
}
