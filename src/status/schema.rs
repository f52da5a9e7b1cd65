//! SQLite schema for the job status database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Job status records
// =============================================================================

const JOB_STATUS_TABLE_V1: Table = Table {
    name: "job_status",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("job_guid", &SqlType::Text, non_null = true),
        sqlite_column!("parent_guid", &SqlType::Text),
        sqlite_column!("container_id", &SqlType::Text, non_null = true),
        sqlite_column!("provider", &SqlType::Text, non_null = true, default_value = Some("''")),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("info", &SqlType::Text),
        sqlite_column!("data_url", &SqlType::Text),
        sqlite_column!("description", &SqlType::Text),
        sqlite_column!("file_path", &SqlType::Text),
        sqlite_column!("email", &SqlType::Text),
        sqlite_column!("had_error", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("checkpoint", &SqlType::Text),
        sqlite_column!("active_task", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("modified_at", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_job_status_guid", "job_guid"),
        ("idx_job_status_parent", "parent_guid, container_id"),
        ("idx_job_status_modified", "status, modified_at"),
    ],
};

// =============================================================================
// Version 2 - Scoped key-value properties
// =============================================================================

const PROPERTIES_TABLE_V2: Table = Table {
    name: "properties",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("scope", &SqlType::Text, non_null = true),
        sqlite_column!("key", &SqlType::Text, non_null = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
        sqlite_column!("updated_at", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_properties_scope_key", "scope, key")],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    PROPERTIES_TABLE_V2.create(conn)
}

pub const STATUS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[JOB_STATUS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[JOB_STATUS_TABLE_V1, PROPERTIES_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];
