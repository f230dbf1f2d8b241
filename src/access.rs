//! Access rules: what may be uploaded, and who may download through a share link.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::auth::{hash_password, verify_password};
use crate::error::{AppError, Result};
use crate::models::{Permission, PermissionKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadName {
    /// Sanitised name shown to users and sent back on download.
    pub display_name: String,
    /// Lower-cased extension, already checked against the allow-list.
    pub extension: String,
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some('_')
            } else if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                Some(c)
            } else {
                None
            }
        })
        .collect();
    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

/// Validate a client-supplied filename and derive a filesystem-safe display name.
/// The result is never used as a storage path.
pub fn prepare_upload_name(client_filename: &str, allowed: &BTreeSet<String>) -> Result<UploadName> {
    let base = client_filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() {
        return Err(AppError::Validation(
            "No file selected for uploading.".to_string(),
        ));
    }

    let (stem, raw_ext) = base
        .rsplit_once('.')
        .ok_or_else(|| AppError::Validation("File type not allowed.".to_string()))?;
    let extension = raw_ext.to_ascii_lowercase();
    if extension.is_empty() || !allowed.contains(&extension) {
        return Err(AppError::Validation("File type not allowed.".to_string()));
    }

    let mut stem = sanitize_component(stem);
    if stem.is_empty() {
        stem = "file".to_string();
    }
    Ok(UploadName {
        display_name: format!("{stem}.{raw_ext}"),
        extension,
    })
}

pub fn generate_internal_name(extension: &str) -> String {
    format!("{}.{extension}", Uuid::new_v4().simple())
}

/// Password from an `Authorization: Basic ...` header. A value without a colon
/// is taken as the password itself.
pub fn basic_auth_password(header: Option<&str>) -> Option<String> {
    let header = header?;
    let (scheme, encoded) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let password = match decoded.split_once(':') {
        Some((_, password)) => password.to_string(),
        None => decoded,
    };
    Some(password)
}

/// Query parameter first, then the Basic-auth header. Empty values count as absent.
pub fn supplied_password(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    query
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .or_else(|| basic_auth_password(authorization))
        .filter(|p| !p.is_empty())
}

/// Share-link download decision.
pub fn authorize_download(permission: &Permission, supplied: Option<&str>) -> Result<()> {
    match permission {
        Permission::Public => Ok(()),
        Permission::Password(hash) => match supplied {
            None | Some("") => Err(AppError::Unauthorized("Password required.".to_string())),
            Some(password) if verify_password(password, hash) => Ok(()),
            Some(_) => Err(AppError::Unauthorized("Incorrect password.".to_string())),
        },
        Permission::Private => Err(AppError::Forbidden("This file is private.".to_string())),
    }
}

/// Build the new permission state for an owner's request, hashing the file
/// password when one is required.
pub fn resolve_permission(
    kind: PermissionKind,
    password: Option<&str>,
    cost: u32,
) -> Result<Permission> {
    match kind {
        PermissionKind::Private => Ok(Permission::Private),
        PermissionKind::Public => Ok(Permission::Public),
        PermissionKind::Password => match password {
            Some(password) if !password.is_empty() => {
                Ok(Permission::Password(hash_password(password, cost)?))
            }
            _ => Err(AppError::Validation(
                "Password is required for 'password' permission.".to_string(),
            )),
        },
    }
}
