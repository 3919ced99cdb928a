//! SQLite schema definitions for the jobs database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::Connection;

// =============================================================================
// Version 1 - Jobs
// =============================================================================

const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("data", &SqlType::Text, non_null = true),
        sqlite_column!("progress", &SqlType::Integer, non_null = true),
        // Unix milliseconds
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_activity_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_jobs_status_created", "status, created_at"),
        ("idx_jobs_type_created", "job_type, created_at DESC"),
    ],
};

// =============================================================================
// Version 2 - Claim timestamp
// =============================================================================

const JOBS_TABLE_V2: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("data", &SqlType::Text, non_null = true),
        sqlite_column!("progress", &SqlType::Integer, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_activity_at", &SqlType::Integer, non_null = true),
        sqlite_column!("start_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_jobs_status_created", "status, created_at"),
        ("idx_jobs_type_created", "job_type, created_at DESC"),
    ],
};

fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE jobs ADD COLUMN start_at INTEGER", [])?;
    // Jobs already running when the column appeared started no later than their last activity
    conn.execute(
        "UPDATE jobs SET start_at = last_activity_at WHERE status != 'pending'",
        [],
    )?;
    Ok(())
}

pub const JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[JOBS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[JOBS_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];
