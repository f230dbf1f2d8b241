//! Upload, permission, download and deletion flows.
//!
//! The registry is the source of truth. Uploads write bytes before the row and
//! undo the write if the row cannot be committed; deletions remove the row first
//! and treat a leftover artifact as a warning.

use chrono::Duration;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::fs;
use uuid::Uuid;

use crate::access::{
    authorize_download, generate_internal_name, prepare_upload_name, resolve_permission,
};
use crate::auth::{hash_password, TokenService};
use crate::config::Config;
use crate::db::DbConnection;
use crate::error::{AppError, Result, TokenError};
use crate::models::{FileRecord, Identity, PermissionKind, User};
use crate::storage::FileStorage;
use crate::{registry, users};

pub type AppState = Arc<ShareVault>;

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub allowed_extensions: BTreeSet<String>,
    pub max_upload_bytes: u64,
}

/// Outcome of an owner's delete request. A second delete of the same file is
/// `NotFound`, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// An authorised share-link download, ready to stream.
#[derive(Debug)]
pub struct Download {
    pub record: FileRecord,
    pub file: fs::File,
    pub len: u64,
}

pub struct ShareVault {
    db: DbConnection,
    storage: FileStorage,
    tokens: TokenService,
    policy: UploadPolicy,
    bcrypt_cost: u32,
    decoy_hash: String,
}

/// Run bcrypt work on the blocking pool so it never stalls a runtime worker.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Internal(format!("blocking task failed: {e}")))?
}

impl ShareVault {
    pub fn new(
        db: DbConnection,
        storage: FileStorage,
        tokens: TokenService,
        policy: UploadPolicy,
        bcrypt_cost: u32,
    ) -> Self {
        // Same cost as real hashes. An invalid cost also fails every registration.
        let decoy_hash = hash_password("sharevault-decoy", bcrypt_cost).unwrap_or_default();
        Self {
            db,
            storage,
            tokens,
            policy,
            bcrypt_cost,
            decoy_hash,
        }
    }

    pub fn from_config(config: &Config, db: DbConnection) -> Result<Self> {
        let storage = FileStorage::new(&config.storage.upload_root)?;
        let tokens = TokenService::new(
            &config.auth.jwt_secret,
            Duration::hours(config.auth.token_expiry_hours),
        );
        let policy = UploadPolicy {
            allowed_extensions: config.storage.allowed_extensions.clone(),
            max_upload_bytes: config.storage.max_upload_bytes,
        };
        Ok(Self::new(db, storage, tokens, policy, config.auth.bcrypt_cost))
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.policy.max_upload_bytes
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<User> {
        let (username, password) = (username.to_owned(), password.to_owned());
        let cost = self.bcrypt_cost;
        let prepared = run_blocking(move || users::new_user(&username, &password, cost)).await;
        let created = match prepared {
            Ok(new_user) => {
                let conn = self.db.lock().await;
                users::create_user(&conn, new_user)
            }
            Err(e) => Err(e),
        };
        match created {
            Ok(user) => {
                tracing::info!(user_id = %user.id, username = %user.username, outcome = "ok", "user registered");
                Ok(user)
            }
            Err(e) => {
                tracing::info!(outcome = "rejected", reason = %e, "registration failed");
                Err(e)
            }
        }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let candidate = {
            let conn = self.db.lock().await;
            users::find_by_username(&conn, username)?
        };
        let (password, decoy) = (password.to_owned(), self.decoy_hash.clone());
        let verified =
            run_blocking(move || users::verify_credentials(candidate, &password, &decoy)).await;
        match verified {
            Ok(user) => {
                let token = self.tokens.issue(&user)?;
                tracing::info!(user_id = %user.id, outcome = "ok", "login");
                Ok(token)
            }
            Err(e) => {
                tracing::info!(outcome = "denied", "login failed");
                Err(e)
            }
        }
    }

    pub fn authenticate(&self, token: Option<&str>) -> std::result::Result<Identity, TokenError> {
        self.tokens.validate(token)
    }

    /// Remove every artifact the user owns (best-effort), then their file rows
    /// and user row in one transaction. Artifacts already removed stay removed
    /// if the transaction rolls back.
    pub async fn delete_account(&self, identity: &Identity) -> Result<usize> {
        let owned = {
            let conn = self.db.lock().await;
            registry::list_by_owner(&conn, identity.user_id)?
        };
        self.purge_account(identity, &owned).await
    }

    /// `owned` is the listing taken before the transaction. Rows it misses are
    /// cleaned up from what the transaction actually deleted.
    async fn purge_account(&self, identity: &Identity, owned: &[FileRecord]) -> Result<usize> {
        for file in owned {
            if let Err(e) = self.storage.remove(&file.internal_name).await {
                tracing::warn!(user_id = %identity.user_id, file_id = %file.id, error = %e, "could not remove artifact during account deletion");
            }
        }

        let deleted = {
            let mut conn = self.db.lock().await;
            let tx = conn.transaction()?;
            let deleted = registry::delete_all_by_owner(&tx, identity.user_id)?;
            if !users::delete_user(&tx, identity.user_id)? {
                return Err(AppError::NotFound("User".to_string()));
            }
            tx.commit()?;
            deleted
        };

        // Rows committed after the listing above still own artifacts.
        let cleaned: HashSet<&str> = owned.iter().map(|f| f.internal_name.as_str()).collect();
        for file in deleted
            .iter()
            .filter(|f| !cleaned.contains(f.internal_name.as_str()))
        {
            if let Err(e) = self.storage.remove(&file.internal_name).await {
                tracing::warn!(user_id = %identity.user_id, file_id = %file.id, error = %e, "could not remove artifact during account deletion");
            }
        }

        tracing::info!(user_id = %identity.user_id, files = deleted.len(), outcome = "ok", "account deleted");
        Ok(deleted.len())
    }

    pub async fn upload(
        &self,
        identity: &Identity,
        bytes: &[u8],
        client_filename: &str,
    ) -> Result<FileRecord> {
        let size = bytes.len() as u64;
        if size > self.policy.max_upload_bytes {
            return Err(AppError::PayloadTooLarge(self.policy.max_upload_bytes));
        }
        let name = prepare_upload_name(client_filename, &self.policy.allowed_extensions)?;
        let internal_name = generate_internal_name(&name.extension);

        let owner = {
            let conn = self.db.lock().await;
            users::get_user(&conn, identity.user_id)?
        };
        if owner.is_none() {
            tracing::info!(user_id = %identity.user_id, outcome = "rejected", "upload for deleted account");
            return Err(AppError::NotFound("User".to_string()));
        }

        self.storage.store(bytes, &internal_name).await?;

        let inserted = {
            let conn = self.db.lock().await;
            registry::insert(&conn, identity.user_id, &name.display_name, &internal_name, size)
        };
        match inserted {
            Ok(record) => {
                tracing::info!(user_id = %identity.user_id, file_id = %record.id, size, outcome = "ok", "file uploaded");
                Ok(record)
            }
            Err(e) => {
                if matches!(e, AppError::NotFound(_)) {
                    tracing::info!(user_id = %identity.user_id, "owner vanished during upload, removing artifact");
                } else {
                    tracing::error!(user_id = %identity.user_id, error = %e, "registering upload failed, removing artifact");
                }
                if let Err(cleanup) = self.storage.remove(&internal_name).await {
                    tracing::error!(user_id = %identity.user_id, error = %cleanup, "could not remove orphaned artifact");
                }
                Err(e)
            }
        }
    }

    pub async fn list_files(&self, identity: &Identity) -> Result<Vec<FileRecord>> {
        let conn = self.db.lock().await;
        registry::list_by_owner(&conn, identity.user_id)
    }

    /// Owner-only. Files owned by someone else are reported as not found.
    pub async fn get_metadata(&self, file_id: Uuid, identity: &Identity) -> Result<FileRecord> {
        let record = {
            let conn = self.db.lock().await;
            registry::get_by_id(&conn, file_id)?
        };
        match record {
            Some(record) if record.owner_id == identity.user_id => Ok(record),
            _ => Err(AppError::NotFound("File".to_string())),
        }
    }

    pub async fn set_permission(
        &self,
        file_id: Uuid,
        identity: &Identity,
        permission: &str,
        password: Option<&str>,
    ) -> Result<FileRecord> {
        let kind: PermissionKind = permission.parse()?;
        let (password, cost) = (password.map(str::to_owned), self.bcrypt_cost);
        let permission =
            run_blocking(move || resolve_permission(kind, password.as_deref(), cost)).await?;

        let conn = self.db.lock().await;
        if !registry::update_permission(&conn, file_id, identity.user_id, &permission)? {
            tracing::info!(user_id = %identity.user_id, file_id = %file_id, outcome = "not_found", "permission change refused");
            return Err(AppError::NotFound("File".to_string()));
        }
        tracing::info!(user_id = %identity.user_id, file_id = %file_id, permission = %kind, outcome = "ok", "permission changed");
        registry::get_by_id(&conn, file_id)?.ok_or_else(|| AppError::NotFound("File".to_string()))
    }

    pub async fn download(&self, link_id: &str, supplied_password: Option<&str>) -> Result<Download> {
        let record = {
            let conn = self.db.lock().await;
            registry::get_by_share_link(&conn, link_id)?
        }
        .ok_or_else(|| AppError::NotFound("File".to_string()))?;

        let permission = record.permission.clone();
        let supplied = supplied_password.map(str::to_owned);
        let decision =
            run_blocking(move || authorize_download(&permission, supplied.as_deref())).await;
        if let Err(e) = decision {
            tracing::info!(file_id = %record.id, permission = %record.permission.kind(), outcome = "denied", "download refused");
            return Err(e);
        }

        let (file, len) = match self.storage.retrieve(&record.internal_name).await {
            Ok(opened) => opened,
            Err(AppError::NotFound(what)) => {
                tracing::warn!(file_id = %record.id, "registry row has no artifact");
                return Err(AppError::NotFound(what));
            }
            Err(e) => return Err(e),
        };
        tracing::info!(file_id = %record.id, owner_id = %record.owner_id, outcome = "ok", "file downloaded");
        Ok(Download { record, file, len })
    }

    pub async fn delete_file(&self, file_id: Uuid, identity: &Identity) -> Result<DeleteOutcome> {
        let deleted = {
            let conn = self.db.lock().await;
            registry::delete_by_owner(&conn, file_id, identity.user_id)?
        };
        let Some(record) = deleted else {
            tracing::info!(user_id = %identity.user_id, file_id = %file_id, outcome = "not_found", "delete refused");
            return Ok(DeleteOutcome::NotFound);
        };

        if let Err(e) = self.storage.remove(&record.internal_name).await {
            tracing::warn!(user_id = %identity.user_id, file_id = %file_id, error = %e, "row deleted but artifact removal failed");
        }
        tracing::info!(user_id = %identity.user_id, file_id = %file_id, outcome = "ok", "file deleted");
        Ok(DeleteOutcome::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::establish_in_memory;
    use crate::models::Permission;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn vault() -> (ShareVault, TempDir) {
        vault_with_cost(4)
    }

    fn vault_with_cost(bcrypt_cost: u32) -> (ShareVault, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("uploads")).unwrap();
        let policy = UploadPolicy {
            allowed_extensions: ["txt", "png"].into_iter().map(String::from).collect(),
            max_upload_bytes: 64,
        };
        let vault = ShareVault::new(
            establish_in_memory().unwrap(),
            storage,
            TokenService::new("test-secret", Duration::hours(1)),
            policy,
            bcrypt_cost,
        );
        (vault, dir)
    }

    async fn signed_in(vault: &ShareVault, name: &str) -> Identity {
        vault.register(name, "secret123").await.unwrap();
        let token = vault.login(name, "secret123").await.unwrap();
        vault.authenticate(Some(&token)).unwrap()
    }

    async fn read_all(mut download: Download) -> Vec<u8> {
        let mut buf = Vec::new();
        download.file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    async fn stored_hash(vault: &ShareVault, file_id: Uuid) -> Option<String> {
        let conn = vault.db.lock().await;
        conn.query_row(
            "SELECT access_password_hash FROM files WHERE id = ?1",
            [file_id.to_string()],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_public_round_trip() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let record = vault.upload(&alice, b"0123456789", "notes.txt").await.unwrap();
        assert_eq!(record.permission, Permission::Private);
        assert_ne!(record.internal_name, "notes.txt");

        vault
            .set_permission(record.id, &alice, "public", None)
            .await
            .unwrap();
        let download = vault.download(&record.download_link_id, None).await.unwrap();
        assert_eq!(download.record.filename, "notes.txt");
        assert_eq!(download.len, 10);
        assert_eq!(read_all(download).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_password_protected_download() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let record = vault.upload(&alice, b"0123456789", "notes.txt").await.unwrap();
        vault
            .set_permission(record.id, &alice, "password", Some("secret123"))
            .await
            .unwrap();

        let link = &record.download_link_id;
        assert!(matches!(
            vault.download(link, None).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            vault.download(link, Some("wrong")).await,
            Err(AppError::Unauthorized(_))
        ));
        let download = vault.download(link, Some("secret123")).await.unwrap();
        assert_eq!(read_all(download).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_private_files_never_download_by_link() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let record = vault.upload(&alice, b"hello", "notes.txt").await.unwrap();
        assert!(matches!(
            vault.download(&record.download_link_id, None).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_password_hash_only_during_password_window() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let record = vault.upload(&alice, b"hello", "notes.txt").await.unwrap();
        assert!(stored_hash(&vault, record.id).await.is_none());

        vault
            .set_permission(record.id, &alice, "password", Some("pw1234"))
            .await
            .unwrap();
        assert!(stored_hash(&vault, record.id).await.is_some());

        let updated = vault
            .set_permission(record.id, &alice, "public", None)
            .await
            .unwrap();
        assert_eq!(updated.permission, Permission::Public);
        assert!(stored_hash(&vault, record.id).await.is_none());
    }

    #[tokio::test]
    async fn test_set_permission_validation_and_ownership() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let bob = signed_in(&vault, "bob").await;
        let record = vault.upload(&alice, b"hello", "notes.txt").await.unwrap();

        assert!(matches!(
            vault.set_permission(record.id, &alice, "shared", None).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            vault.set_permission(record.id, &alice, "password", None).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            vault.set_permission(record.id, &bob, "public", None).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(
            vault.get_metadata(record.id, &alice).await.unwrap().permission,
            Permission::Private
        );
    }

    #[tokio::test]
    async fn test_upload_rejections_touch_nothing() {
        let (vault, dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        assert!(matches!(
            vault.upload(&alice, b"MZ", "virus.exe").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            vault.upload(&alice, &[0u8; 65], "big.txt").await,
            Err(AppError::PayloadTooLarge(64))
        ));
        let entries = std::fs::read_dir(dir.path().join("uploads")).unwrap().count();
        assert_eq!(entries, 0);
        assert!(vault.list_files(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_after_account_deletion_is_not_found() {
        let (vault, dir) = vault();
        let bob = signed_in(&vault, "bob").await;
        vault.delete_account(&bob).await.unwrap();

        // The token still validates, but the owner is gone.
        let err = vault.upload(&bob, b"hello", "notes.txt").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(ref what) if what == "User"));
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
        let entries = std::fs::read_dir(dir.path().join("uploads")).unwrap().count();
        assert_eq!(entries, 0);
    }

    #[tokio::test]
    async fn test_account_deletion_rolls_back_rows_but_not_artifacts() {
        let (vault, _dir) = vault();
        let bob = signed_in(&vault, "bob").await;
        let record = vault.upload(&bob, b"hello", "notes.txt").await.unwrap();
        vault
            .db
            .lock()
            .await
            .execute_batch(
                "CREATE TRIGGER keep_users BEFORE DELETE ON users
                 BEGIN SELECT RAISE(ABORT, 'users are pinned'); END;",
            )
            .unwrap();

        assert!(matches!(
            vault.delete_account(&bob).await,
            Err(AppError::Database(_))
        ));
        assert_eq!(vault.get_metadata(record.id, &bob).await.unwrap().id, record.id);
        assert!(vault.login("bob", "secret123").await.is_ok());
        assert!(!vault.storage().exists(&record.internal_name).await);
    }

    #[tokio::test]
    async fn test_account_deletion_cleans_rows_missing_from_listing() {
        let (vault, _dir) = vault();
        let bob = signed_in(&vault, "bob").await;
        let listed = vault.upload(&bob, b"one", "a.txt").await.unwrap();
        let late = vault.upload(&bob, b"two", "b.txt").await.unwrap();

        let removed = vault
            .purge_account(&bob, std::slice::from_ref(&listed))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(!vault.storage().exists(&listed.internal_name).await);
        assert!(!vault.storage().exists(&late.internal_name).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_login_does_not_hold_the_database() {
        let (vault, _dir) = vault_with_cost(12);
        let vault = Arc::new(vault);
        let alice = signed_in(&vault, "alice").await;

        let login = tokio::spawn({
            let vault = vault.clone();
            async move { vault.login("alice", "secret123").await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        vault.list_files(&alice).await.unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
        assert!(login.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_user_costs_a_password_check() {
        let (vault, _dir) = vault_with_cost(10);
        vault.register("alice", "secret123").await.unwrap();

        let started = std::time::Instant::now();
        assert!(vault.login("alice", "wrong-pass").await.is_err());
        let wrong_password = started.elapsed();

        let started = std::time::Instant::now();
        assert!(vault.login("mallory", "wrong-pass").await.is_err());
        let unknown_user = started.elapsed();

        assert!(unknown_user * 4 > wrong_password);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let record = vault.upload(&alice, b"hello", "notes.txt").await.unwrap();

        assert_eq!(
            vault.delete_file(record.id, &alice).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            vault.delete_file(record.id, &alice).await.unwrap(),
            DeleteOutcome::NotFound
        );
        assert!(matches!(
            vault.download(&record.download_link_id, None).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            vault.storage().retrieve(&record.internal_name).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_by_non_owner_is_not_found() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let bob = signed_in(&vault, "bob").await;
        let record = vault.upload(&alice, b"hello", "notes.txt").await.unwrap();

        assert_eq!(
            vault.delete_file(record.id, &bob).await.unwrap(),
            DeleteOutcome::NotFound
        );
        assert!(vault.storage().exists(&record.internal_name).await);
        assert!(matches!(
            vault.get_metadata(record.id, &bob).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_succeeds_when_artifact_already_gone() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let record = vault.upload(&alice, b"hello", "notes.txt").await.unwrap();
        vault.storage().remove(&record.internal_name).await.unwrap();

        assert_eq!(
            vault.delete_file(record.id, &alice).await.unwrap(),
            DeleteOutcome::Deleted
        );
    }

    #[tokio::test]
    async fn test_ghost_row_downloads_as_not_found() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let record = vault.upload(&alice, b"hello", "notes.txt").await.unwrap();
        vault
            .set_permission(record.id, &alice, "public", None)
            .await
            .unwrap();
        vault.storage().remove(&record.internal_name).await.unwrap();

        assert!(matches!(
            vault.download(&record.download_link_id, None).await,
            Err(AppError::NotFound(_))
        ));
        assert!(vault.get_metadata(record.id, &alice).await.is_ok());
    }

    #[tokio::test]
    async fn test_account_deletion_cascades() {
        let (vault, _dir) = vault();
        let bob = signed_in(&vault, "bob").await;
        let alice = signed_in(&vault, "alice").await;
        let first = vault.upload(&bob, b"one", "a.txt").await.unwrap();
        let second = vault.upload(&bob, b"two", "b.png").await.unwrap();
        let kept = vault.upload(&alice, b"three", "c.txt").await.unwrap();

        assert_eq!(vault.delete_account(&bob).await.unwrap(), 2);

        for record in [&first, &second] {
            assert!(matches!(
                vault.get_metadata(record.id, &bob).await,
                Err(AppError::NotFound(_))
            ));
            assert!(!vault.storage().exists(&record.internal_name).await);
        }
        assert!(vault.storage().exists(&kept.internal_name).await);
        assert!(matches!(
            vault.login("bob", "secret123").await,
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            vault.delete_account(&bob).await,
            Err(AppError::NotFound(_))
        ));
        // The name is free again.
        assert!(vault.register("bob", "secret123").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_files_newest_first() {
        let (vault, _dir) = vault();
        let alice = signed_in(&vault, "alice").await;
        let first = vault.upload(&alice, b"1", "one.txt").await.unwrap();
        let second = vault.upload(&alice, b"2", "two.txt").await.unwrap();
        let listed: Vec<_> = vault
            .list_files(&alice)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(listed, vec![second.id, first.id]);
    }
}
