use rusqlite::{Connection, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type DbConnection = Arc<Mutex<Connection>>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS files (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        internal_name TEXT NOT NULL UNIQUE,
        size INTEGER NOT NULL,
        uploaded_at TEXT NOT NULL,
        permission TEXT NOT NULL DEFAULT 'private'
            CHECK (permission IN ('private', 'public', 'password')),
        access_password_hash TEXT,
        download_link_id TEXT NOT NULL UNIQUE,
        CHECK ((permission = 'password') = (access_password_hash IS NOT NULL)),
        FOREIGN KEY (owner_id) REFERENCES users (id)
    );

    CREATE INDEX IF NOT EXISTS idx_files_owner ON files (owner_id, uploaded_at);
";

pub fn establish_connection(path: impl AsRef<Path>) -> Result<DbConnection> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                tracing::error!(dir = %parent.display(), error = %e, "cannot create database directory");
            }
        }
    }
    let conn = Connection::open(path)?;
    init(conn)
}

pub fn establish_in_memory() -> Result<DbConnection> {
    init(Connection::open_in_memory()?)
}

fn init(conn: Connection) -> Result<DbConnection> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.execute_batch(SCHEMA)?;
    Ok(Arc::new(Mutex::new(conn)))
}
