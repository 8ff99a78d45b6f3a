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

pub mod errors;
pub mod queue;
pub mod simulate;

use anyhow::{Context, Result};
use tracklane::dal::DAL;
use tracklane::Database;

/// Opens the client store and brings its schema up to date.
pub async fn open_store(database_url: &str) -> Result<DAL> {
    let database = Database::new(database_url)
        .with_context(|| format!("Failed to open client store at {}", database_url))?;
    database
        .run_migrations()
        .await
        .context("Failed to run migrations")?;
    Ok(DAL::new(database))
}
