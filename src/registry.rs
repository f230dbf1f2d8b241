//! File registry: the authoritative record of every stored file.
//!
//! Each mutation is a single SQL statement, so a permission and its password
//! hash always change together or not at all. Functions take a `&Connection`
//! so they can also run inside a caller's `Transaction`.

use chrono::Utc;
use rusqlite::{ffi, params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::auth::generate_link_id;
use crate::error::{AppError, Result};
use crate::models::{format_time, time_at, uuid_at, FileRecord, Permission};

const FILE_COLUMNS: &str = "id, owner_id, filename, internal_name, size, uploaded_at, \
                            permission, access_password_hash, download_link_id";

fn map_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let kind: String = row.get(6)?;
    let hash: Option<String> = row.get(7)?;
    let permission = Permission::from_columns(&kind, hash).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let size: i64 = row.get(4)?;
    Ok(FileRecord {
        id: uuid_at(row, 0)?,
        owner_id: uuid_at(row, 1)?,
        filename: row.get(2)?,
        internal_name: row.get(3)?,
        size: size.max(0) as u64,
        uploaded_at: time_at(row, 5)?,
        permission,
        download_link_id: row.get(8)?,
    })
}

pub fn insert(
    conn: &Connection,
    owner_id: Uuid,
    display_name: &str,
    internal_name: &str,
    size: u64,
) -> Result<FileRecord> {
    let size_column = i64::try_from(size)
        .map_err(|_| AppError::Validation("File is too large".to_string()))?;
    let record = FileRecord {
        id: Uuid::new_v4(),
        owner_id,
        filename: display_name.to_string(),
        internal_name: internal_name.to_string(),
        size,
        uploaded_at: Utc::now(),
        permission: Permission::Private,
        download_link_id: generate_link_id(),
    };
    let inserted = conn.execute(
        "INSERT INTO files (id, owner_id, filename, internal_name, size, uploaded_at, permission, access_password_hash, download_link_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8)",
        params![
            record.id.to_string(),
            owner_id.to_string(),
            record.filename,
            record.internal_name,
            size_column,
            format_time(&record.uploaded_at),
            record.permission.kind().as_str(),
            record.download_link_id,
        ],
    );
    match inserted {
        Ok(_) => Ok(record),
        // The owner was deleted while holding a still-valid token.
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            Err(AppError::NotFound("User".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_by_id(conn: &Connection, file_id: Uuid) -> Result<Option<FileRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
            [file_id.to_string()],
            map_file,
        )
        .optional()?;
    Ok(record)
}

pub fn get_by_share_link(conn: &Connection, link_id: &str) -> Result<Option<FileRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE download_link_id = ?1"),
            [link_id],
            map_file,
        )
        .optional()?;
    Ok(record)
}

/// Newest upload first.
pub fn list_by_owner(conn: &Connection, owner_id: Uuid) -> Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FILE_COLUMNS} FROM files WHERE owner_id = ?1 ORDER BY uploaded_at DESC, rowid DESC"
    ))?;
    let files = stmt
        .query_map([owner_id.to_string()], map_file)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(files)
}

/// Replace permission and hash in one statement. `false` means no row with this
/// id belongs to `owner_id`.
pub fn update_permission(
    conn: &Connection,
    file_id: Uuid,
    owner_id: Uuid,
    permission: &Permission,
) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE files SET permission = ?1, access_password_hash = ?2 WHERE id = ?3 AND owner_id = ?4",
        params![
            permission.kind().as_str(),
            permission.password_hash(),
            file_id.to_string(),
            owner_id.to_string()
        ],
    )?;
    Ok(updated > 0)
}

/// Delete an owned row, handing back what was removed so the caller can clean
/// up the artifact. `None` means not found or not owned.
pub fn delete_by_owner(
    conn: &Connection,
    file_id: Uuid,
    owner_id: Uuid,
) -> Result<Option<FileRecord>> {
    let record = conn
        .query_row(
            &format!("DELETE FROM files WHERE id = ?1 AND owner_id = ?2 RETURNING {FILE_COLUMNS}"),
            [file_id.to_string(), owner_id.to_string()],
            map_file,
        )
        .optional()?;
    Ok(record)
}

pub fn delete_all_by_owner(conn: &Connection, owner_id: Uuid) -> Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare(&format!(
        "DELETE FROM files WHERE owner_id = ?1 RETURNING {FILE_COLUMNS}"
    ))?;
    let deleted = stmt
        .query_map([owner_id.to_string()], map_file)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(deleted)
}
