//! 远端写入：登录即授权，缺失目录时逐级创建后仅重试一次。

use std::io::{self, Read};
use std::sync::Arc;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, warn};

use crate::auth::Credentials;
use crate::body::UploadStream;
use crate::error::UploadError;
use crate::ftp::{Dialer, SessionGuard, TransferError, TransferSession};
use crate::routes::RouteTable;

/// 统计已读出的字节数，重试前据此判断流是否仍未被消费。
struct CountingReader<'a> {
    inner: &'a mut dyn Read,
    consumed: u64,
}

impl Read for CountingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.consumed += read as u64;
        Ok(read)
    }
}

/// 按词法清理路径：合并 `//` 与 `.`，解析 `..`，保留开头的 `/`。
pub fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            segment => segments.push(segment),
        }
    }
    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// 服务器视角下的存储路径，用于路由匹配。
pub fn canonical_path(
    session: &mut dyn TransferSession,
    path: &str,
) -> Result<String, TransferError> {
    if path.starts_with('/') {
        return Ok(clean_path(path));
    }
    let cwd = session.current_directory()?;
    Ok(clean_path(&format!("{cwd}/{path}")))
}

/// 把 `reader` 存到 `path`。首次因父目录缺失失败时逐级创建目录并仅重试一次，
/// 第二次失败即为最终结果。
pub fn store_creating_directories(
    session: &mut dyn TransferSession,
    path: &str,
    reader: &mut dyn Read,
) -> Result<u64, UploadError> {
    let mut reader = CountingReader {
        inner: reader,
        consumed: 0,
    };

    let first = match session.store(path, &mut reader) {
        Ok(written) => return Ok(written),
        Err(err) => err,
    };
    if !matches!(first, TransferError::PathUnavailable(_)) || !path.contains('/') {
        error!(path, error = %first, "store file");
        return Err(UploadError::Internal(first.to_string()));
    }
    if reader.consumed > 0 {
        error!(
            path,
            consumed = reader.consumed,
            error = %first,
            "store failed after reading upload; not retrying"
        );
        return Err(UploadError::Internal(first.to_string()));
    }

    debug!(path, error = %first, "parent directory missing, creating");
    create_parent_directories(session, path)?;

    session.store(path, &mut reader).map_err(|err| {
        error!(path, error = %err, "store file after creating directories");
        UploadError::Internal(err.to_string())
    })
}

fn create_parent_directories(
    session: &mut dyn TransferSession,
    path: &str,
) -> Result<(), UploadError> {
    let (mut directory, relative) = match path.strip_prefix('/') {
        Some(rest) => ("/".to_string(), rest),
        None => (String::new(), path),
    };
    let Some((parents, _file)) = relative.rsplit_once('/') else {
        return Ok(());
    };

    for segment in parents.split('/').filter(|segment| !segment.is_empty()) {
        if !directory.is_empty() && !directory.ends_with('/') {
            directory.push('/');
        }
        directory.push_str(segment);
        match session.make_directory(&directory) {
            Ok(()) => debug!(directory = %directory, "created directory"),
            Err(TransferError::AlreadyExists(_)) => {}
            Err(err) => {
                warn!(directory = %directory, error = %err, "make directory");
                return Err(UploadError::BadRequest(err.to_string()));
            }
        }
    }
    Ok(())
}

/// FTP 后端：每个请求独占一个会话。
pub struct RemoteWriter {
    dialer: Arc<dyn Dialer>,
    routes: RouteTable,
}

impl RemoteWriter {
    pub fn new(dialer: Arc<dyn Dialer>, routes: RouteTable) -> Self {
        Self { dialer, routes }
    }

    /// 拨号并用请求凭证登录。拨号失败属于后端错误，登录失败一律视为凭证被拒。
    pub async fn open_session(&self, credentials: &Credentials) -> Result<SessionGuard, UploadError> {
        let dialer = self.dialer.clone();
        let credentials = credentials.clone();
        tokio::task::spawn_blocking(move || {
            let session = dialer.dial().map_err(|err| {
                error!(error = %err, "dial ftp");
                UploadError::Internal(err.to_string())
            })?;
            let mut session = SessionGuard::new(session);
            if let Err(err) = session.login(&credentials.username, &credentials.password) {
                debug!(user = %credentials.username, error = %err, "ftp login");
                session.finish();
                return Err(UploadError::Forbidden(err.to_string()));
            }
            Ok(session)
        })
        .await
        .map_err(|err| {
            error!(error = %err, "ftp login task");
            UploadError::Internal(err.to_string())
        })?
    }

    /// 存储上传并返回规范路径。无论结果如何，返回前会话均已退出。
    pub async fn store(
        &self,
        mut session: SessionGuard,
        path: String,
        stream: UploadStream,
    ) -> Result<String, UploadError> {
        let mut reader = SyncIoBridge::new(stream);
        tokio::task::spawn_blocking(move || {
            let result = canonical_path(&mut *session, &path)
                .map_err(|err| {
                    error!(path = %path, error = %err, "query working directory");
                    UploadError::Internal(err.to_string())
                })
                .and_then(|canonical| {
                    let written = store_creating_directories(&mut *session, &path, &mut reader)?;
                    debug!(path = %canonical, bytes = written, "remote write done");
                    Ok(canonical)
                });
            session.finish();
            result
        })
        .await
        .map_err(|err| {
            error!(error = %err, "ftp store task");
            UploadError::Internal(err.to_string())
        })?
    }

    /// 规范路径对应的公开 URL，无匹配路由时为空。
    pub fn public_url(
        &self,
        canonical: &str,
        credentials: &Credentials,
    ) -> Result<String, UploadError> {
        self.routes.render(canonical, credentials).map_err(|err| {
            error!(path = canonical, error = %err, "render url template");
            UploadError::Internal(err.to_string())
        })
    }
}
