//! Database schema for archive.db.
//!
//! Holds libraries, their media items and the durable job queue shared by the
//! server and the operator CLI.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

const LIBRARIES_TABLE_V0: Table = Table {
    name: "libraries",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("path", &SqlType::Text, non_null = true),
        sqlite_column!("category", &SqlType::Text, non_null = true),
        sqlite_column!("storage_class", &SqlType::Text, non_null = true),
        sqlite_column!("bucket_name", &SqlType::Text, non_null = true),
        sqlite_column!(
            "is_updating",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[],
};

const MEDIA_ITEMS_TABLE_V0: Table = Table {
    name: "media_items",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "library_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "libraries",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("path", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("archived_status", &SqlType::Text, non_null = true),
        sqlite_column!("date_archived", &SqlType::Integer),
        sqlite_column!("date_last_modified", &SqlType::Integer, non_null = true),
        sqlite_column!("size", &SqlType::Integer, non_null = true),
        sqlite_column!("is_archiving", &SqlType::Integer, non_null = true),
        sqlite_column!("is_tarring", &SqlType::Integer, non_null = true),
        sqlite_column!("upload_progress", &SqlType::Integer, non_null = true),
        sqlite_column!("is_recovering", &SqlType::Integer, non_null = true),
        sqlite_column!("is_restoring", &SqlType::Integer, non_null = true),
        sqlite_column!("is_restored", &SqlType::Integer, non_null = true),
        sqlite_column!("download_progress", &SqlType::Integer, non_null = true),
        sqlite_column!("download_outcome", &SqlType::Text),
        sqlite_column!("is_job_cancelled", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_media_library_status", "library_id, archived_status"),
        ("idx_media_archiving", "is_archiving"),
        ("idx_media_recovering", "is_recovering"),
        ("idx_media_restoring", "is_restoring"),
    ],
};

const JOB_QUEUE_TABLE_V0: Table = Table {
    name: "job_queue",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("queue", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("enqueued_at", &SqlType::Integer, non_null = true),
        sqlite_column!("claimed_at", &SqlType::Integer),
    ],
    indices: &[("idx_job_queue_pending", "queue, status, id")],
};

pub const ARCHIVE_DB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[LIBRARIES_TABLE_V0, MEDIA_ITEMS_TABLE_V0, JOB_QUEUE_TABLE_V0],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = &ARCHIVE_DB_VERSIONED_SCHEMAS[0];
        schema.create(&conn).expect("schema should create");
        schema.validate(&conn).expect("schema should validate");
    }

    #[test]
    fn test_media_path_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        ARCHIVE_DB_VERSIONED_SCHEMAS[0].create(&conn).unwrap();
        conn.execute(
            "INSERT INTO libraries (name, path, category, storage_class, bucket_name)
             VALUES ('music', '/music', 'OTHER', 'GLACIER', 'b')",
            [],
        )
        .unwrap();

        let insert = "INSERT INTO media_items (
                library_id, name, path, archived_status, date_last_modified, size,
                is_archiving, is_tarring, upload_progress, is_recovering, is_restoring,
                is_restored, download_progress, is_job_cancelled
            ) VALUES (1, 'a', '/music/a', 'NOT_ARCHIVED', 0, 0, 0, 0, -1, 0, 0, 0, -1, 0)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
