//! 上传请求处理：鉴权、选择请求体、写入后端并返回公开 URL。

use axum::body::Body as AxumBody;
use axum::extract::Extension;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Basic};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::auth::{CredentialStore, Credentials, resolve_identity};
use crate::body::{is_empty_body, select_upload};
use crate::error::UploadError;
use crate::privsep::LocalWriter;
use crate::remote::RemoteWriter;

/// 本地文件系统后端：SQL 身份查询加降权子进程写入。
pub struct LocalBackend {
    store: Arc<dyn CredentialStore>,
    writer: LocalWriter,
    uid_offset: i64,
    url_prefix: String,
}

impl LocalBackend {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        writer: LocalWriter,
        uid_offset: i64,
        url_prefix: String,
    ) -> Self {
        Self {
            store,
            writer,
            uid_offset,
            url_prefix,
        }
    }

    async fn upload(
        &self,
        credentials: &Credentials,
        headers: &HeaderMap,
        uri: &Uri,
        body: AxumBody,
    ) -> Result<String, UploadError> {
        let identity = resolve_identity(self.store.as_ref(), credentials, self.uid_offset).await?;
        let source = select_upload(headers, uri, body).await?;
        self.writer
            .write(identity, &source.path, source.stream)
            .await?;
        Ok(format!("{}{}", self.url_prefix, source.path))
    }
}

pub enum Backend {
    Local(LocalBackend),
    Remote(RemoteWriter),
}

/// 请求间共享的只读状态。
pub struct Gateway {
    backend: Backend,
}

impl Gateway {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn kind(&self) -> &'static str {
        match self.backend {
            Backend::Local(_) => "local",
            Backend::Remote(_) => "ftp",
        }
    }
}

async fn upload_remote(
    remote: &RemoteWriter,
    credentials: &Credentials,
    headers: &HeaderMap,
    uri: &Uri,
    body: AxumBody,
) -> Result<String, UploadError> {
    let session = remote.open_session(credentials).await?;
    let source = match select_upload(headers, uri, body).await {
        Ok(source) => source,
        Err(err) => {
            session.close().await;
            return Err(err);
        }
    };
    let canonical = remote.store(session, source.path, source.stream).await?;
    remote.public_url(&canonical, credentials)
}

/// 处理上传：`POST /<path>`，原始请求体或 multipart。
pub async fn handle_upload(
    Extension(gateway): Extension<Arc<Gateway>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<Response, UploadError> {
    if is_empty_body(&body) {
        return Err(UploadError::BadRequest("empty body".into()));
    }
    // Deliberately 400 rather than 405.
    if method != Method::POST {
        return Err(UploadError::BadRequest(format!("method {method}")));
    }
    let Some(authorization) = headers.typed_get::<Authorization<Basic>>() else {
        return Err(UploadError::Forbidden("missing basic credentials".into()));
    };
    let credentials = Credentials::from(&authorization);

    let result = match &gateway.backend {
        Backend::Local(local) => local.upload(&credentials, &headers, &uri, body).await,
        Backend::Remote(remote) => {
            upload_remote(remote, &credentials, &headers, &uri, body).await
        }
    };
    let url = result.inspect_err(|err| match err {
        UploadError::Internal(_) => error!(
            user = %credentials.username,
            path = uri.path(),
            error = %err,
            "upload failed"
        ),
        _ => debug!(
            user = %credentials.username,
            status = %err.status(),
            path = uri.path(),
            error = %err,
            "upload rejected"
        ),
    })?;

    info!(user = %credentials.username, url = %url, "upload stored");
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        url,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::MemoryStore;
    use crate::body::tests::{multipart_body, multipart_headers};
    use crate::privsep::ExecutableImage;
    use crate::privsep::tests::{install_script, own_identity};
    use crate::remote::tests::FakeDialer;
    use crate::routes::{RouteRule, RouteTable};
    use crate::template::Template;
    use http_body_util::BodyExt;
    use tempfile::{TempDir, tempdir};

    const HELPER_SCRIPT: &str = r#"#!/bin/sh
mkdir -p "$(dirname "$2")" || exit 127
cat > "$2" || exit 1
"#;

    fn local_gateway() -> (TempDir, Arc<Gateway>) {
        let temp = tempdir().expect("tempdir");
        let program = install_script(temp.path(), HELPER_SCRIPT);
        let identity = own_identity(temp.path());
        // The fake store hands out the caller's own uid so the helper can run
        // unprivileged.
        let store = MemoryStore::with("bob", "pw", i64::from(identity.uid) - 100);
        let writer = LocalWriter::new(
            ExecutableImage::from_path(program),
            temp.path().join("storage"),
            None,
        );
        let backend = LocalBackend::new(
            Arc::new(store),
            writer,
            100,
            "https://files.example.org/".into(),
        );
        (temp, Arc::new(Gateway::new(Backend::Local(backend))))
    }

    fn remote_gateway(dialer: FakeDialer) -> Arc<Gateway> {
        let routes = RouteTable::new(vec![RouteRule::new(
            regex_lite::Regex::new(r"^/home/(\w+)/(.*)$").expect("pattern"),
            Template::parse("https://%1%.example.org/%2%").expect("template"),
        )]);
        Arc::new(Gateway::new(Backend::Remote(RemoteWriter::new(
            Arc::new(dialer),
            routes,
        ))))
    }

    fn with_auth(mut headers: HeaderMap, user: &str, password: &str) -> HeaderMap {
        headers.typed_insert(Authorization::basic(user, password));
        headers
    }

    async fn call(
        gateway: &Arc<Gateway>,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: AxumBody,
    ) -> (StatusCode, String) {
        let response = match handle_upload(
            Extension(gateway.clone()),
            method,
            path.parse().expect("uri"),
            headers,
            body,
        )
        .await
        {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        (status, String::from_utf8(body.to_vec()).expect("utf8 body"))
    }

    #[tokio::test]
    async fn empty_body_is_bad_request_before_auth() {
        let (_temp, gateway) = local_gateway();
        let (status, _) = call(
            &gateway,
            Method::POST,
            "/f.txt",
            HeaderMap::new(),
            AxumBody::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_is_bad_request() {
        let (_temp, gateway) = local_gateway();
        let headers = with_auth(HeaderMap::new(), "bob", "pw");
        let (status, _) = call(&gateway, Method::GET, "/f.txt", headers, AxumBody::from("x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_credentials_are_forbidden() {
        let (_temp, gateway) = local_gateway();
        let (status, _) = call(
            &gateway,
            Method::POST,
            "/f.txt",
            HeaderMap::new(),
            AxumBody::from("x"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_credentials_write_nothing() {
        let (temp, gateway) = local_gateway();
        let headers = with_auth(HeaderMap::new(), "bob", "wrong");
        let (status, body) =
            call(&gateway, Method::POST, "/f.txt", headers, AxumBody::from("x")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.is_empty());
        assert!(!temp.path().join("storage").exists());
    }

    #[tokio::test]
    async fn local_raw_upload_returns_prefixed_url() {
        let (temp, gateway) = local_gateway();
        for _ in 0..2 {
            let headers = with_auth(HeaderMap::new(), "bob", "pw");
            let (status, body) = call(
                &gateway,
                Method::POST,
                "//docs/a.txt",
                headers,
                AxumBody::from("hello"),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "https://files.example.org/docs/a.txt");
        }
        let stored = std::fs::read(temp.path().join("storage/docs/a.txt")).expect("read");
        assert_eq!(stored, b"hello");
    }

    #[tokio::test]
    async fn local_multipart_upload_uses_first_named_part() {
        let (temp, gateway) = local_gateway();
        let headers = with_auth(multipart_headers(), "bob", "pw");
        let body = multipart_body(&[
            ("a", Some(""), "skip"),
            ("b", Some(""), "skip"),
            ("file", Some("f.txt"), "multipart content"),
        ]);
        let (status, url) = call(
            &gateway,
            Method::POST,
            "/ignored",
            headers,
            AxumBody::from(body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(url, "https://files.example.org/f.txt");
        let stored = std::fs::read(temp.path().join("storage/f.txt")).expect("read");
        assert_eq!(stored, b"multipart content");
    }

    #[tokio::test]
    async fn response_is_plain_text() {
        let (_temp, gateway) = local_gateway();
        let headers = with_auth(HeaderMap::new(), "bob", "pw");
        let response = handle_upload(
            Extension(gateway),
            Method::POST,
            "/t.txt".parse().expect("uri"),
            headers,
            AxumBody::from("x"),
        )
        .await
        .unwrap_or_else(|_| panic!("upload failed"));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("content type"),
            "text/plain"
        );
    }

    #[tokio::test]
    async fn remote_upload_creates_directories_and_renders_url() {
        let dialer = FakeDialer::new("/home/bob");
        let journal = dialer.journal.clone();
        let gateway = remote_gateway(dialer);
        let headers = with_auth(HeaderMap::new(), "bob", "pw");
        let (status, url) = call(
            &gateway,
            Method::POST,
            "/a/b/c.txt",
            headers,
            AxumBody::from("remote"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(url, "https://bob.example.org/a/b/c.txt");

        let journal = journal.lock().expect("journal");
        assert_eq!(journal.mkdirs, vec!["/home/bob/a", "/home/bob/a/b"]);
        assert_eq!(journal.stores.len(), 2);
        assert_eq!(journal.quits, 1);
    }

    #[tokio::test]
    async fn remote_unmatched_path_returns_empty_body() {
        let gateway = remote_gateway(FakeDialer::new("/srv"));
        let headers = with_auth(HeaderMap::new(), "bob", "pw");
        let (status, url) =
            call(&gateway, Method::POST, "/x.txt", headers, AxumBody::from("x")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(url.is_empty());
    }

    #[tokio::test]
    async fn remote_rejected_login_is_forbidden() {
        let dialer = FakeDialer::new("/home/bob");
        let journal = dialer.journal.clone();
        let gateway = remote_gateway(dialer);
        let headers = with_auth(HeaderMap::new(), "bob", "bad");
        let (status, _) =
            call(&gateway, Method::POST, "/x.txt", headers, AxumBody::from("x")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let journal = journal.lock().expect("journal");
        assert!(journal.stores.is_empty());
        assert_eq!(journal.quits, 1);
    }

    #[tokio::test]
    async fn remote_bad_path_still_quits_session() {
        let dialer = FakeDialer::new("/home/bob");
        let journal = dialer.journal.clone();
        let gateway = remote_gateway(dialer);
        let headers = with_auth(HeaderMap::new(), "bob", "pw");
        let (status, _) = call(&gateway, Method::POST, "/", headers, AxumBody::from("x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let journal = journal.lock().expect("journal");
        assert_eq!(journal.quits, 1);
        assert_ne!(journal.quit_threads, vec![std::thread::current().id()]);
    }
}
