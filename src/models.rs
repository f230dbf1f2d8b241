use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// The authenticated caller, passed explicitly into every owner-scoped operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// Permission kind as named by clients and stored in the `permission` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Private,
    Public,
    Password,
}

impl PermissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::Private => "private",
            PermissionKind::Public => "public",
            PermissionKind::Password => "password",
        }
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(PermissionKind::Private),
            "public" => Ok(PermissionKind::Public),
            "password" => Ok(PermissionKind::Password),
            other => Err(AppError::Validation(format!(
                "Invalid permission value '{other}'. Must be 'public', 'private', or 'password'."
            ))),
        }
    }
}

/// Access state of a file. The password hash lives only inside `Password`, so a
/// hash can never be attached to any other state.
#[derive(Clone, PartialEq, Eq)]
pub enum Permission {
    Private,
    Public,
    Password(String),
}

impl Permission {
    pub fn kind(&self) -> PermissionKind {
        match self {
            Permission::Private => PermissionKind::Private,
            Permission::Public => PermissionKind::Public,
            Permission::Password(_) => PermissionKind::Password,
        }
    }

    pub fn password_hash(&self) -> Option<&str> {
        match self {
            Permission::Password(hash) => Some(hash),
            _ => None,
        }
    }

    /// Rebuild from the two stored columns, rejecting inconsistent pairs.
    pub fn from_columns(kind: &str, hash: Option<String>) -> Result<Self, AppError> {
        match (kind.parse::<PermissionKind>()?, hash) {
            (PermissionKind::Private, None) => Ok(Permission::Private),
            (PermissionKind::Public, None) => Ok(Permission::Public),
            (PermissionKind::Password, Some(hash)) => Ok(Permission::Password(hash)),
            (kind, _) => Err(AppError::Internal(format!(
                "stored permission '{kind}' has an inconsistent password hash"
            ))),
        }
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permission::{:?}", self.kind())
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.kind().serialize(serializer)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    #[serde(skip_serializing)]
    pub internal_name: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub permission: Permission,
    pub download_link_id: String,
}

pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
