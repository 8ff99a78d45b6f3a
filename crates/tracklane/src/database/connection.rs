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

//! SQLite connection pool.
//!
//! SQLite handles concurrent writers poorly even in WAL mode, so the pool
//! holds exactly one connection. Every DAL call borrows it, runs its work
//! inside `interact`, and hands it back.
//!
//! ```rust,ignore
//! use tracklane::database::Database;
//!
//! let db = Database::new("/var/lib/courier/tracking.db")?;
//! db.run_migrations().await?;
//! ```

use crate::error::StoreError;
use deadpool_diesel::sqlite::{Manager as SqliteManager, Pool as SqlitePool, Runtime};
use tracing::info;

const SQLITE_POOL_SIZE: usize = 1;

/// Handle to the durable client store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    url: String,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("url", &self.url).finish()
    }
}

impl Database {
    /// Opens a pool for a SQLite path, a `sqlite://` URL or `:memory:`.
    ///
    /// No connection is made until the first query.
    pub fn new(connection_string: &str) -> Result<Self, StoreError> {
        let url = Self::build_sqlite_url(connection_string);
        let manager = SqliteManager::new(url.clone(), Runtime::Tokio1);
        let pool = SqlitePool::builder(manager)
            .max_size(SQLITE_POOL_SIZE)
            .build()
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))?;

        info!(url = %url, "SQLite connection pool initialized (size: {})", SQLITE_POOL_SIZE);
        Ok(Self { pool, url })
    }

    /// Strips an optional `sqlite://` scheme.
    fn build_sqlite_url(connection_string: &str) -> String {
        match connection_string.strip_prefix("sqlite://") {
            Some(path) => path.to_string(),
            None => connection_string.to_string(),
        }
    }

    /// Applies connection pragmas and any pending migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        use diesel::prelude::*;
        use diesel_migrations::MigrationHarness;

        let conn = self.get_connection().await?;
        conn.interact(|conn| -> Result<(), StoreError> {
            // WAL lets readers proceed during writes; busy_timeout waits out
            // locks held by another process instead of failing immediately.
            diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
            diesel::sql_query("PRAGMA busy_timeout=30000;").execute(conn)?;

            conn.run_pending_migrations(super::SQLITE_MIGRATIONS)
                .map(|_| ())
                .map_err(|e| StoreError::Migration(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::ConnectionPool(e.to_string()))??;

        info!(url = %self.url, "Database migrations applied");
        Ok(())
    }

    /// Borrows the pooled connection.
    pub async fn get_connection(
        &self,
    ) -> Result<deadpool::managed::Object<SqliteManager>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::ConnectionPool(e.to_string()))
    }
}
