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

//! `queue list` and `queue purge`.

use super::open_store;
use anyhow::{Context, Result};
use tracing::info;
use tracklane::{OperationPayload, PendingOperation};

/// One line per operation: position, id, delivery, type, retries and payload.
fn describe(position: usize, op: &PendingOperation) -> String {
    let detail = match &op.payload {
        OperationPayload::Location { sample } => {
            format!("({:.6}, {:.6})", sample.latitude, sample.longitude)
        }
        OperationPayload::Status { status, .. } => format!("-> {}", status),
        OperationPayload::Completion { .. } => "-> delivered".to_string(),
    };
    let waiting = op
        .not_before
        .map(|at| format!(" not before {}", at.to_rfc3339()))
        .unwrap_or_default();
    format!(
        "{:>3}  {}  {}  {:<19}  retries={} priority={}  {}{}",
        position,
        op.operation_id,
        op.entity_id,
        op.op_type().as_str(),
        op.retry_count,
        op.priority.as_str(),
        detail,
        waiting
    )
}

pub async fn list(database_url: &str) -> Result<()> {
    let dal = open_store(database_url).await?;
    let pending = dal
        .pending_operations()
        .list()
        .await
        .context("Failed to list pending operations")?;

    if pending.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for (position, op) in pending.iter().enumerate() {
        println!("{}", describe(position + 1, op));
    }
    Ok(())
}

pub async fn purge(database_url: &str, entity_id: &str) -> Result<()> {
    let dal = open_store(database_url).await?;
    let dropped = dal
        .pending_operations()
        .purge_entity(entity_id)
        .await
        .with_context(|| format!("Failed to purge operations for {}", entity_id))?;

    info!(entity_id, dropped, "Queue purged");
    println!("Dropped {} pending operation(s) for {}", dropped, entity_id);
    Ok(())
}
