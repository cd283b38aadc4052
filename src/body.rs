//! 请求体选择（multipart 或原始请求体）与存储路径解析。

use axum::body::{Body, HttpBody};
use axum::http::{HeaderMap, Uri, header};
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use multer::Multipart;
use percent_encoding::percent_decode_str;
use std::io;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::error::UploadError;

/// 上传内容字节流，只能从头到尾读取一次。
pub type UploadStream = Pin<Box<dyn AsyncRead + Send>>;

/// 上传的目标路径与内容来源。
pub struct UploadSource {
    pub path: String,
    pub stream: UploadStream,
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSource")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// 请求体长度确定为 0 时返回 true。
pub fn is_empty_body(body: &Body) -> bool {
    body.size_hint().exact() == Some(0)
}

/// 将客户端路径规范化为相对存储路径：去掉空段与 `.`，拒绝 `..`。
pub fn normalize_storage_path(raw: &str) -> Result<String, UploadError> {
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(UploadError::BadRequest(format!(
                    "parent segment in path {raw}"
                )));
            }
            segment => segments.push(segment),
        }
    }
    if segments.is_empty() {
        return Err(UploadError::BadRequest("empty path".into()));
    }
    Ok(segments.join("/"))
}

/// 为请求选择上传内容流与存储路径。
pub async fn select_upload(
    headers: &HeaderMap,
    uri: &Uri,
    body: Body,
) -> Result<UploadSource, UploadError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("multipart/form-data") {
        select_multipart(content_type, body).await
    } else {
        select_raw(uri, body)
    }
}

fn select_raw(uri: &Uri, body: Body) -> Result<UploadSource, UploadError> {
    let decoded = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|err| UploadError::BadRequest(format!("undecodable url path: {err}")))?;
    let path = normalize_storage_path(decoded.trim_start_matches('/'))?;
    let stream = BodyExt::into_data_stream(body).map_err(io::Error::other);
    Ok(UploadSource {
        path,
        stream: Box::pin(StreamReader::new(stream)),
    })
}

async fn select_multipart(content_type: &str, body: Body) -> Result<UploadSource, UploadError> {
    let boundary = multer::parse_boundary(content_type).map_err(|err| {
        warn!(error = %err, "open multipart reader");
        UploadError::BadRequest(err.to_string())
    })?;
    let mut multipart = Multipart::new(BodyExt::into_data_stream(body), boundary);

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| {
                warn!(error = %err, "read multipart part");
                UploadError::BadRequest(err.to_string())
            })?
            .ok_or_else(|| {
                warn!("multipart body has no part with a file name");
                UploadError::BadRequest("no file part".into())
            })?;

        let file_name = field.file_name().unwrap_or("");
        let trimmed = file_name.strip_prefix('/').unwrap_or(file_name);
        if trimmed.is_empty() {
            debug!(field = ?field.name(), "skip multipart part without file name");
            continue;
        }
        let path = normalize_storage_path(trimmed)?;
        let stream = field.map_err(io::Error::other);
        return Ok(UploadSource {
            path,
            stream: Box::pin(StreamReader::new(stream)),
        });
    }
}
