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

//! Diesel table definitions for the durable client store.

diesel::table! {
    pending_operations (operation_id) {
        operation_id -> Text,
        entity_id -> Text,
        operation_type -> Text,
        payload -> Text,
        retry_count -> Integer,
        priority -> Text,
        position -> BigInt,
        created_at -> Text,
        not_before -> Nullable<Text>,
    }
}

diesel::table! {
    error_records (id) {
        id -> Text,
        error_type -> Text,
        operation_id -> Text,
        entity_id -> Text,
        retry_count -> Integer,
        max_retries -> Integer,
        strategy -> Text,
        status -> Text,
        last_error -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    entity_snapshots (entity_id) {
        entity_id -> Text,
        record -> Text,
        updated_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(pending_operations, error_records, entity_snapshots);
