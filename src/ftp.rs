//! FTP 传输会话：拨号、登录、存储、建目录，以及保证退出的会话守卫。

use std::io::Read;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use suppaftp::types::Response;
use suppaftp::{FtpError, FtpStream, Status};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("connect: {0}")]
    Connect(String),

    #[error("login rejected: {0}")]
    Rejected(String),

    #[error("path unavailable: {0}")]
    PathUnavailable(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("transfer failed: {0}")]
    Protocol(String),
}

/// 单个文件传输会话（已登录或待登录）。
///
/// 所有方法都会阻塞，调用方需在阻塞线程池中执行。
pub trait TransferSession: Send {
    fn login(&mut self, username: &str, password: &str) -> Result<(), TransferError>;

    /// 把 `reader` 存到 `path`；父目录缺失时返回 [`TransferError::PathUnavailable`]。
    fn store(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, TransferError>;

    /// 目录已存在时返回 [`TransferError::AlreadyExists`]。
    fn make_directory(&mut self, path: &str) -> Result<(), TransferError>;

    fn current_directory(&mut self) -> Result<String, TransferError>;

    /// 结束会话，可重复调用。
    fn quit(&mut self);
}

/// 打开新的未登录会话。
pub trait Dialer: Send + Sync {
    fn dial(&self) -> Result<Box<dyn TransferSession>, TransferError>;
}

/// 持有会话，所有退出路径上都会退出登录。
///
/// `QUIT` 会阻塞：正常路径在阻塞线程池里调用 [`SessionGuard::finish`] 或
/// [`SessionGuard::close`]；若守卫在运行时线程上被丢弃（请求被取消等），
/// 退出动作转交给阻塞线程池。
pub struct SessionGuard {
    session: Box<dyn TransferSession>,
    open: bool,
}

impl SessionGuard {
    pub fn new(session: Box<dyn TransferSession>) -> Self {
        Self {
            session,
            open: true,
        }
    }

    /// 立即退出会话（阻塞）。重复调用无副作用。
    pub fn finish(&mut self) {
        if self.open {
            self.open = false;
            self.session.quit();
        }
    }

    /// 在阻塞线程池中退出会话并等待完成。
    pub async fn close(mut self) {
        if let Err(err) = tokio::task::spawn_blocking(move || self.finish()).await {
            error!(error = %err, "ftp quit task");
        }
    }
}

impl Deref for SessionGuard {
    type Target = dyn TransferSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut session = std::mem::replace(&mut self.session, Box::new(ClosedSession));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || session.quit());
            }
            Err(_) => session.quit(),
        }
    }
}

/// 已交出的会话占位。
struct ClosedSession;

impl TransferSession for ClosedSession {
    fn login(&mut self, _username: &str, _password: &str) -> Result<(), TransferError> {
        Err(TransferError::Protocol("session already closed".into()))
    }

    fn store(&mut self, _path: &str, _reader: &mut dyn Read) -> Result<u64, TransferError> {
        Err(TransferError::Protocol("session already closed".into()))
    }

    fn make_directory(&mut self, _path: &str) -> Result<(), TransferError> {
        Err(TransferError::Protocol("session already closed".into()))
    }

    fn current_directory(&mut self) -> Result<String, TransferError> {
        Err(TransferError::Protocol("session already closed".into()))
    }

    fn quit(&mut self) {}
}

/// 带连接超时地拨号固定的 FTP 端点。
#[derive(Debug, Clone)]
pub struct FtpDialer {
    host: String,
    port: u16,
    timeout: Duration,
}

impl FtpDialer {
    pub fn new(host: String, port: u16, timeout: Duration) -> Self {
        Self {
            host,
            port,
            timeout,
        }
    }

    fn resolve(&self) -> Result<SocketAddr, TransferError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| TransferError::Connect(err.to_string()))?
            .next()
            .ok_or_else(|| TransferError::Connect(format!("no address for {}", self.host)))
    }
}

impl Dialer for FtpDialer {
    fn dial(&self) -> Result<Box<dyn TransferSession>, TransferError> {
        let addr = self.resolve()?;
        let stream = FtpStream::connect_timeout(addr, self.timeout)
            .map_err(|err| TransferError::Connect(err.to_string()))?;
        debug!(%addr, "ftp session opened");
        Ok(Box::new(FtpSession {
            stream: Some(stream),
        }))
    }
}

/// 基于 `suppaftp` 的会话，退出后为 `None`。
pub struct FtpSession {
    stream: Option<FtpStream>,
}

impl FtpSession {
    fn stream(&mut self) -> Result<&mut FtpStream, TransferError> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransferError::Protocol("session already closed".into()))
    }
}

fn is_file_unavailable(err: &FtpError) -> bool {
    matches!(
        err,
        FtpError::UnexpectedResponse(Response {
            status: Status::FileUnavailable,
            ..
        })
    )
}

impl TransferSession for FtpSession {
    fn login(&mut self, username: &str, password: &str) -> Result<(), TransferError> {
        self.stream()?
            .login(username, password)
            .map_err(|err| TransferError::Rejected(err.to_string()))
    }

    fn store(&mut self, path: &str, reader: &mut dyn Read) -> Result<u64, TransferError> {
        let mut reader = reader;
        self.stream()?
            .put_file(path, &mut reader)
            .map_err(|err| {
                if is_file_unavailable(&err) {
                    TransferError::PathUnavailable(err.to_string())
                } else {
                    TransferError::Protocol(err.to_string())
                }
            })
    }

    fn make_directory(&mut self, path: &str) -> Result<(), TransferError> {
        self.stream()?.mkdir(path).map_err(|err| {
            if is_file_unavailable(&err) {
                TransferError::AlreadyExists(err.to_string())
            } else {
                TransferError::Protocol(err.to_string())
            }
        })
    }

    fn current_directory(&mut self) -> Result<String, TransferError> {
        self.stream()?
            .pwd()
            .map_err(|err| TransferError::Protocol(err.to_string()))
    }

    fn quit(&mut self) {
        if let Some(mut stream) = self.stream.take()
            && let Err(err) = stream.quit()
        {
            warn!(error = %err, "ftp quit");
        }
    }
}
