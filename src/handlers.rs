use crate::access::supplied_password;
use crate::auth::bearer_token;
use crate::error::{AppError, TokenError};
use crate::models::{FileRecord, Identity};
use crate::service::{AppState, DeleteOutcome};
use axum::{
    async_trait,
    body::Body,
    extract::{multipart::MultipartError, FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Deserialize)]
pub struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Serialize)]
pub struct AuthToken {
    message: &'static str,
    token: String,
}

#[derive(Deserialize)]
pub struct PermissionRequest {
    #[serde(default)]
    permission: String,
    password: Option<String>,
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    password: Option<String>,
}

#[derive(Serialize)]
pub struct FileList {
    files: Vec<FileRecord>,
    count: usize,
}

/// Caller identity from `Authorization: Bearer <token>`.
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .map(|value| value.to_str().map_err(|_| TokenError::Malformed))
            .transpose()?;
        let token = bearer_token(header)?;
        Ok(AuthUser(state.authenticate(Some(token))?))
    }
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn register_user(
    State(state): State<AppState>,
    Json(user_data): Json<Credentials>,
) -> Result<Response, AppError> {
    let user = state
        .register(&user_data.username, &user_data.password)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": "User registered successfully", "user": user })),
    )
        .into_response())
}

pub async fn login_user(
    State(state): State<AppState>,
    Json(login_data): Json<Credentials>,
) -> Result<Json<AuthToken>, AppError> {
    let token = state
        .login(&login_data.username, &login_data.password)
        .await?;
    Ok(Json(AuthToken {
        message: "Login successful",
        token,
    }))
}

pub async fn delete_account(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let files_deleted = state.delete_account(&identity).await?;
    Ok(Json(json!({
        "message": "Account deleted successfully.",
        "files_deleted": files_deleted
    })))
}

fn multipart_error(err: MultipartError, limit: u64) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(limit)
    } else {
        AppError::Validation(err.body_text())
    }
}

pub async fn upload_file(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let limit = state.max_upload_bytes();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(|e| multipart_error(e, limit))?;

        let record = state.upload(&identity, &data, &filename).await?;
        return Ok((
            StatusCode::CREATED,
            Json(json!({ "message": "File uploaded successfully.", "file": record })),
        )
            .into_response());
    }

    Err(AppError::Validation(
        "No file part in the request.".to_string(),
    ))
}

pub async fn get_user_files(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> Result<Json<FileList>, AppError> {
    let files = state.list_files(&identity).await?;
    Ok(Json(FileList {
        count: files.len(),
        files,
    }))
}

pub async fn get_file_metadata(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(file_id): Path<Uuid>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(state.get_metadata(file_id, &identity).await?))
}

pub async fn set_file_permission(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(file_id): Path<Uuid>,
    Json(request): Json<PermissionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = state
        .set_permission(
            file_id,
            &identity,
            &request.permission,
            request.password.as_deref(),
        )
        .await?;
    Ok(Json(json!({
        "message": format!("File permission updated to '{}' successfully.", record.permission.kind()),
        "file": record
    })))
}

pub async fn delete_file(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(file_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.delete_file(file_id, &identity).await? {
        DeleteOutcome::Deleted => Ok(Json(json!({ "message": "File deleted successfully." }))),
        DeleteOutcome::NotFound => Err(AppError::NotFound("File".to_string())),
    }
}

pub async fn download_shared_file(
    State(state): State<AppState>,
    Path(link_id): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let password = supplied_password(query.password.as_deref(), authorization);

    let download = state.download(&link_id, password.as_deref()).await?;
    let record = download.record;
    let mime_type = mime_guess::from_path(&record.filename).first_or_octet_stream();
    let body = Body::from_stream(ReaderStream::new(download.file));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime_type.as_ref())
        .header(header::CONTENT_LENGTH, download.len)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", record.filename),
        )
        // A permission change must take effect on the very next request.
        .header(header::CACHE_CONTROL, "no-store")
        .body(body)
        .map_err(|e| AppError::Internal(format!("building download response: {e}")))
}
