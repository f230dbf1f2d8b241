//! Identity store: user records and credential checks.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use uuid::Uuid;

use crate::auth::{hash_password, verify_password};
use crate::error::{AppError, Result};
use crate::models::{format_time, time_at, uuid_at, User};

pub const MIN_USERNAME_LEN: usize = 3;
pub const MIN_PASSWORD_LEN: usize = 4;

const USER_COLUMNS: &str = "id, username, password_hash, created_at";

pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, 0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: time_at(row, 3)?,
    })
}

pub fn find_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
            [normalize_username(username)],
            map_user,
        )
        .optional()?;
    Ok(user)
}

/// A validated registration whose password is already hashed.
#[derive(Debug)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
}

/// Validate a registration and hash its password. Touches no database, so it
/// can run off the connection lock.
pub fn new_user(username: &str, password: &str, cost: u32) -> Result<NewUser> {
    let username = normalize_username(username);
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(AppError::Validation(format!(
            "Username must be at least {MIN_USERNAME_LEN} characters"
        )));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(NewUser {
        username,
        password_hash: hash_password(password, cost)?,
    })
}

pub fn create_user(conn: &Connection, new_user: NewUser) -> Result<User> {
    if find_by_username(conn, &new_user.username)?.is_some() {
        return Err(AppError::Conflict("Username already exists".to_string()));
    }

    let user = User {
        id: Uuid::new_v4(),
        username: new_user.username,
        password_hash: new_user.password_hash,
        created_at: Utc::now(),
    };
    let inserted = conn.execute(
        "INSERT INTO users (id, username, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            user.id.to_string(),
            user.username,
            user.password_hash,
            format_time(&user.created_at)
        ],
    );
    match inserted {
        Ok(_) => Ok(user),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(AppError::Conflict("Username already exists".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Check a password against a looked-up user. An unknown user is verified
/// against `decoy_hash` so both failures cost one bcrypt round.
pub fn verify_credentials(
    candidate: Option<User>,
    password: &str,
    decoy_hash: &str,
) -> Result<User> {
    match candidate {
        Some(user) if verify_password(password, &user.password_hash) => Ok(user),
        Some(_) => Err(AppError::InvalidCredentials),
        None => {
            verify_password(password, decoy_hash);
            Err(AppError::InvalidCredentials)
        }
    }
}

pub fn get_user(conn: &Connection, user_id: Uuid) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [user_id.to_string()],
            map_user,
        )
        .optional()?;
    Ok(user)
}

/// Removes only the user row; owned files must already be gone.
pub fn delete_user(conn: &Connection, user_id: Uuid) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM users WHERE id = ?1", [user_id.to_string()])?;
    Ok(deleted > 0)
}

#[cfg(test)]
pub(crate) fn create_test_user(conn: &Connection, username: &str) -> User {
    create_user(conn, new_user(username, "secret123", 4).unwrap()).unwrap()
}
