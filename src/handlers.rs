//! HTTP 处理器：把上传服务暴露为 JSON 接口，并提供支持 Range 的文件下载。

use axum::Error as AxumError;
use axum::Router;
use axum::body::{Body as AxumBody, Bytes};
use axum::extract::multipart::MultipartError;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Extension, Json, Multipart, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum::routing::{get, post, put};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use httpdate::{fmt_http_date, parse_http_date};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DIRECT_MAX_FILES;
use crate::direct::DirectFile;
use crate::error::{ApiError, code};
use crate::identity::{CurrentUser, identity_middleware};
use crate::metadata::FileRow;
use crate::quota::QuotaSnapshot;
use crate::upload::{ChunkOutcome, ChunkParams, InitUpload, SessionProgress, UploadService};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitUploadResponse {
    upload_id: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CleanupRequest {
    upload_id: Uuid,
}

/// 构建上传相关的全部路由，所有路由都要求身份头。
pub fn api_router(service: Arc<UploadService>) -> Router {
    Router::new()
        .route("/api/upload/init", post(init_upload))
        .route(
            "/api/upload/chunk",
            put(upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/cleanup", post(cleanup_upload))
        .route(
            "/api/upload/direct",
            post(upload_direct).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/upload/{upload_id}", get(upload_progress))
        .route("/api/quota", get(quota))
        .route("/api/files/{file_id}/content", get(download_file))
        .layer(middleware::from_fn(identity_middleware))
        .layer(Extension(service))
}

fn invalid_request(rejection: impl std::fmt::Display) -> ApiError {
    ApiError::validation(code::INVALID_REQUEST, rejection.to_string())
}

fn multipart_error(err: MultipartError) -> ApiError {
    ApiError::validation(code::INVALID_REQUEST, format!("malformed multipart body: {err}"))
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("响应头构建失败".into()))
}

pub async fn init_upload(
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Extension(service): Extension<Arc<UploadService>>,
    payload: Result<Json<InitUpload>, JsonRejection>,
) -> Result<(StatusCode, JsonResponse<InitUploadResponse>), ApiError> {
    let Json(request) = payload.map_err(invalid_request)?;
    let upload_id = service.init_upload(user_id, request).await?;
    Ok((
        StatusCode::CREATED,
        JsonResponse(InitUploadResponse { upload_id }),
    ))
}

/// 上传单个分片。请求体最多读取上限加一个字节，超限由服务层按校验顺序拒绝。
pub async fn upload_chunk(
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Extension(service): Extension<Arc<UploadService>>,
    query: Result<Query<ChunkParams>, QueryRejection>,
    body: AxumBody,
) -> Result<JsonResponse<ChunkOutcome>, ApiError> {
    let Query(params) = query.map_err(invalid_request)?;
    let limit = service.config().max_chunk_size.saturating_add(1);
    let bytes = read_body_capped(body, limit).await?;
    debug!(
        upload_id = %params.upload_id,
        chunk_index = params.chunk_index,
        bytes = bytes.len(),
        "chunk received"
    );
    let outcome = service.accept_chunk(user_id, params, bytes).await?;
    Ok(JsonResponse(outcome))
}

async fn read_body_capped(body: AxumBody, limit: u64) -> Result<Bytes, ApiError> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut data_stream = BodyExt::into_data_stream(body);
    let mut buffer = Vec::new();
    while let Some(frame) = data_stream.next().await {
        let frame = frame.map_err(|err: AxumError| {
            ApiError::validation(code::INVALID_REQUEST, format!("failed to read body: {err}"))
        })?;
        let room = limit.saturating_sub(buffer.len());
        if frame.len() >= room {
            buffer.extend_from_slice(&frame[..room]);
            break;
        }
        buffer.extend_from_slice(&frame);
    }
    Ok(Bytes::from(buffer))
}

pub async fn cleanup_upload(
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Extension(service): Extension<Arc<UploadService>>,
    payload: Result<Json<CleanupRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload.map_err(invalid_request)?;
    service.cleanup_upload(user_id, request.upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload_progress(
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Extension(service): Extension<Arc<UploadService>>,
    upload_id: Result<Path<Uuid>, PathRejection>,
) -> Result<JsonResponse<SessionProgress>, ApiError> {
    let Path(upload_id) = upload_id.map_err(invalid_request)?;
    Ok(JsonResponse(
        service.session_progress(user_id, upload_id).await?,
    ))
}

pub async fn quota(
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Extension(service): Extension<Arc<UploadService>>,
) -> Result<JsonResponse<QuotaSnapshot>, ApiError> {
    Ok(JsonResponse(service.quota(user_id).await?))
}

/// 批量直传。`relativePath` 字段按出现顺序与 `file` 字段一一对应。
/// 文件字段边读边写入暂存区，表单解析失败时清理已暂存的文件。
pub async fn upload_direct(
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Extension(service): Extension<Arc<UploadService>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, JsonResponse<Vec<FileRow>>), ApiError> {
    let mut files = Vec::new();
    let (folder_id, relative_paths) =
        match read_direct_form(&service, &mut multipart, &mut files).await {
            Ok(form) => form,
            Err(err) => {
                let staged: Vec<&str> = files.iter().map(|file| file.staged.as_str()).collect();
                service.discard_staged(staged).await;
                return Err(err);
            }
        };
    for (file, relative_path) in files.iter_mut().zip(relative_paths) {
        file.relative_path = Some(relative_path);
    }

    let rows = service.upload_direct(user_id, folder_id, files).await?;
    Ok((StatusCode::CREATED, JsonResponse(rows)))
}

async fn read_direct_form(
    service: &UploadService,
    multipart: &mut Multipart,
    files: &mut Vec<DirectFile>,
) -> Result<(Option<Uuid>, Vec<String>), ApiError> {
    let mut folder_id = None;
    let mut relative_paths = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "folderId" => {
                let text = field.text().await.map_err(multipart_error)?;
                let text = text.trim();
                if !text.is_empty() {
                    folder_id = Some(Uuid::parse_str(text).map_err(|_| {
                        ApiError::validation(code::INVALID_REQUEST, "folderId is not a valid id")
                    })?);
                }
            }
            "relativePath" => relative_paths.push(field.text().await.map_err(multipart_error)?),
            "file" => {
                if files.len() >= DIRECT_MAX_FILES {
                    return Err(ApiError::validation(
                        code::INVALID_REQUEST,
                        format!("at most {DIRECT_MAX_FILES} files per request"),
                    ));
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                let mime_type = field.content_type().map(str::to_string);
                let body = field.map(|chunk| chunk.map_err(multipart_error));
                files.push(service.stage_direct_file(file_name, mime_type, body).await?);
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }
    Ok((folder_id, relative_paths))
}

/// 下载文件，支持单段 Range 与 If-Range。
pub async fn download_file(
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Extension(service): Extension<Arc<UploadService>>,
    file_id: Result<Path<Uuid>, PathRejection>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    let Path(file_id) = file_id.map_err(invalid_request)?;
    let file = service.get_owned_file(user_id, file_id).await?;
    let storage = service.storage();
    let file_size = storage.size(&file.path).await?;
    let modified: SystemTime =
        UNIX_EPOCH + Duration::from_secs(u64::try_from(file.created_at.timestamp()).unwrap_or(0));

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, header_value(&file.mime_type)?);
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified <= date,
            Err(_) => false,
        },
        None => true,
    };
    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(file_id = %file.id, start, end, length, "download range request accepted");
        let stream = storage.stream_read(&file.path, Some((start, end))).await?;
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{file_size}"))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(stream),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, header_value(&file_size.to_string())?);
    info!(file_id = %file.id, size = file_size, "download full file");
    let stream = storage.stream_read(&file.path, None).await?;
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(stream),
    )
        .into_response())
}

/// 解析 Range 头，返回可读取的闭区间。
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let invalid = || ApiError::validation(code::INVALID_REQUEST, "invalid Range header");
    let value = value.to_str().map_err(|_| invalid())?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(invalid());
    };
    if range.contains(',') {
        return Err(ApiError::validation(
            code::INVALID_REQUEST,
            "multiple ranges not supported",
        ));
    }

    let (start_part, end_part) = range.split_once('-').ok_or_else(invalid)?;
    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Err(ApiError::RangeNotSatisfiable(file_size));
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(|_| invalid())?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part.parse().map_err(|_| invalid())?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_ID_HEADER;
    use crate::testing::{Harness, test_config};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn app(harness: &Harness) -> Router {
        api_router(Arc::new(harness.service.clone()))
    }

    async fn send(app: &Router, request: Request<AxumBody>) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, headers, body)
    }

    fn json_body(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).expect("json body")
    }

    fn request(method: &str, uri: &str, user: Uuid) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_ID_HEADER, user.to_string())
    }

    async fn init(app: &Router, user: Uuid, body: Value) -> Uuid {
        let (status, _, bytes) = send(
            app,
            request("POST", "/api/upload/init", user)
                .header(header::CONTENT_TYPE, "application/json")
                .body(AxumBody::from(body.to_string()))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        json_body(&bytes)["uploadId"]
            .as_str()
            .and_then(|id| Uuid::parse_str(id).ok())
            .expect("upload id")
    }

    fn chunk_uri(upload_id: Uuid, index: i64) -> String {
        format!(
            "/api/upload/chunk?uploadId={upload_id}&chunkIndex={index}&totalChunks=3&totalSize=300&filename=notes.txt"
        )
    }

    #[tokio::test]
    async fn requests_without_identity_are_rejected() {
        let harness = Harness::new().await;
        let app = app(&harness);
        let (status, _, bytes) = send(
            &app,
            Request::builder()
                .uri("/api/quota")
                .body(AxumBody::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(&bytes)["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn chunked_upload_then_ranged_download() {
        let harness = Harness::new().await;
        let app = app(&harness);
        let user = Uuid::new_v4();
        let upload_id = init(
            &app,
            user,
            json!({ "filename": "notes.txt", "totalChunks": 3, "totalSize": 300 }),
        )
        .await;

        let mut last = Value::Null;
        for index in 0..3 {
            let (status, _, bytes) = send(
                &app,
                request("PUT", &chunk_uri(upload_id, index), user)
                    .body(AxumBody::from(vec![b'a' + index as u8; 100]))
                    .expect("request"),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            last = json_body(&bytes);
            if index < 2 {
                assert_eq!(last["completed"], false);
                assert_eq!(last["uploadedChunks"], index + 1);
            }
        }
        assert_eq!(last["completed"], true);
        assert_eq!(last["file"]["size"], 300);
        assert!(last["file"].get("path").is_none());
        let file_id = last["file"]["id"].as_str().expect("file id").to_string();

        let (status, headers, bytes) = send(
            &app,
            request("GET", &format!("/api/files/{file_id}/content"), user)
                .header(header::RANGE, "bytes=95-104")
                .body(AxumBody::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 95-104/300");
        assert_eq!(&bytes[..], b"aaaaabbbbb");

        let (status, headers, bytes) = send(
            &app,
            request("GET", &format!("/api/files/{file_id}/content"), user)
                .body(AxumBody::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(bytes.len(), 300);

        let (status, _, _) = send(
            &app,
            request("GET", &format!("/api/files/{file_id}/content"), Uuid::new_v4())
                .body(AxumBody::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, headers, _) = send(
            &app,
            request("GET", &format!("/api/files/{file_id}/content"), user)
                .header(header::RANGE, "bytes=400-")
                .body(AxumBody::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes */300");
    }

    #[tokio::test]
    async fn oversized_chunk_and_bad_query_have_stable_codes() {
        let harness = Harness::new().await;
        let app = app(&harness);
        let user = Uuid::new_v4();
        let upload_id = init(
            &app,
            user,
            json!({ "filename": "notes.txt", "totalChunks": 3, "totalSize": 300 }),
        )
        .await;

        let (status, _, bytes) = send(
            &app,
            request("PUT", &chunk_uri(upload_id, 0), user)
                .body(AxumBody::from(vec![0u8; 4096]))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(&bytes);
        assert_eq!(body["code"], "CHUNK_TOO_LARGE");
        assert_eq!(body["retryable"], false);

        let (status, _, bytes) = send(
            &app,
            request("PUT", "/api/upload/chunk?uploadId=nope", user)
                .body(AxumBody::from("x"))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&bytes)["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn cleanup_then_progress_is_not_found() {
        let harness = Harness::new().await;
        let app = app(&harness);
        let user = Uuid::new_v4();
        let upload_id = init(
            &app,
            user,
            json!({ "filename": "notes.txt", "totalChunks": 3, "totalSize": 300 }),
        )
        .await;

        let (status, _, bytes) = send(
            &app,
            request("GET", &format!("/api/upload/{upload_id}"), user)
                .body(AxumBody::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let progress = json_body(&bytes);
        assert_eq!(progress["status"], "UPLOADING");
        assert_eq!(progress["uploadedChunks"], 0);

        let (status, _, _) = send(
            &app,
            request("POST", "/api/upload/cleanup", user)
                .header(header::CONTENT_TYPE, "application/json")
                .body(AxumBody::from(json!({ "uploadId": upload_id }).to_string()))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _, bytes) = send(
            &app,
            request("GET", &format!("/api/upload/{upload_id}"), user)
                .body(AxumBody::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&bytes)["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn multipart_direct_upload_updates_quota() {
        let harness = Harness::new().await;
        let app = app(&harness);
        let user = Uuid::new_v4();
        let boundary = "drive-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"relativePath\"\r\n\r\n\
             docs\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"relativePath\"\r\n\r\n\
             \r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"b.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             world!\r\n\
             --{boundary}--\r\n"
        );
        let (status, _, bytes) = send(
            &app,
            request("POST", "/api/upload/direct", user)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(AxumBody::from(body))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let rows = json_body(&bytes);
        assert_eq!(rows.as_array().map(Vec::len), Some(2));
        assert_eq!(rows[0]["size"], 5);
        assert!(rows[0]["folderId"].is_string());
        assert!(rows[1]["folderId"].is_null());

        let (status, _, bytes) = send(
            &app,
            request("GET", "/api/quota", user)
                .body(AxumBody::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let quota = json_body(&bytes);
        assert_eq!(quota["storageUsed"], 11);
        assert_eq!(quota["tempStorage"], 0);
        assert_eq!(quota["remaining"], 10_000 - 11);
    }

    #[tokio::test]
    async fn oversized_multipart_file_discards_the_staged_batch() {
        let harness = Harness::new().await;
        let app = app(&harness);
        let user = Uuid::new_v4();
        let boundary = "drive-test-boundary";
        let oversized = "x".repeat(test_config().direct_max_file_size as usize + 1);
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             hello\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"big.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             {oversized}\r\n\
             --{boundary}--\r\n"
        );
        let (status, _, bytes) = send(
            &app,
            request("POST", "/api/upload/direct", user)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(AxumBody::from(body))
                .expect("request"),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(&bytes)["code"], "FILE_TOO_LARGE");
        assert_eq!(harness.blob_count(), 0);
    }

    #[test]
    fn range_parsing() {
        let range = |value: &'static str| parse_range(Some(&HeaderValue::from_static(value)), 100);
        assert_eq!(range("bytes=0-9").expect("range"), Some((0, 9)));
        assert_eq!(range("bytes=90-").expect("range"), Some((90, 99)));
        assert_eq!(range("bytes=-10").expect("range"), Some((90, 99)));
        assert_eq!(range("bytes=50-500").expect("range"), Some((50, 99)));
        assert!(matches!(
            range("bytes=100-"),
            Err(ApiError::RangeNotSatisfiable(100))
        ));
        assert_eq!(
            range("bytes=0-1,5-6").map_err(|err| err.code()).err(),
            Some(code::INVALID_REQUEST)
        );
        assert_eq!(parse_range(None, 100).expect("none"), None);
    }
}
