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

//! `errors list`.

use super::open_store;
use anyhow::{anyhow, Context, Result};
use tracklane::{ErrorRecord, ErrorRecordStatus};

fn parse_status(status: Option<&str>) -> Result<Option<ErrorRecordStatus>> {
    status
        .map(|s| {
            ErrorRecordStatus::parse(&s.trim().to_lowercase()).ok_or_else(|| {
                anyhow!(
                    "Unknown error status '{}'. Use pending, resolved or failed",
                    s
                )
            })
        })
        .transpose()
}

fn describe(record: &ErrorRecord) -> String {
    format!(
        "{}  {}  {}  {:<23}  {}/{}  {}  {}",
        record.operation_id,
        record.entity_id,
        record.status,
        record.error_type.as_str(),
        record.retry_count,
        record.max_retries,
        record.updated_at.to_rfc3339(),
        record.last_error.as_deref().unwrap_or("-")
    )
}

pub async fn list(database_url: &str, status: Option<&str>) -> Result<()> {
    let status = parse_status(status)?;
    let dal = open_store(database_url).await?;
    let records = dal
        .error_records()
        .list(status)
        .await
        .context("Failed to list error records")?;

    if records.is_empty() {
        println!("No error records");
        return Ok(());
    }
    for record in &records {
        println!("{}", describe(record));
    }
    Ok(())
}
