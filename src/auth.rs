//! 凭证提取与身份解析（SQL 凭证库）。

use async_trait::async_trait;
use axum_extra::headers::{Authorization, authorization::Basic};
use sqlx::Row;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use thiserror::Error;
use tracing::error;

use crate::config::SqlConfig;
use crate::error::UploadError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("credential rejected")]
    Rejected,

    #[error("credential backend error: {0}")]
    Backend(String),
}

/// 单个请求携带的 Basic 凭证。
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl From<&Authorization<Basic>> for Credentials {
    fn from(header: &Authorization<Basic>) -> Self {
        Self::new(header.username(), header.password())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// 请求写入时使用的数字 uid/gid。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

/// 把凭证映射为库中保存的原始数字 ID。
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn lookup(&self, credentials: &Credentials) -> Result<i64, AuthError>;
}

/// 基于 MySQL 的凭证库：执行配置的语句，按 `(username, password)` 顺序绑定参数。
pub struct SqlCredentialStore {
    pool: MySqlPool,
    statement: String,
}

impl SqlCredentialStore {
    /// 建立连接池，首个连接失败即返回错误。
    pub async fn connect(config: &SqlConfig) -> Result<Self, sqlx::Error> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.db);
        let pool = MySqlPoolOptions::new().connect_with(options).await?;
        Ok(Self {
            pool,
            statement: config.request.clone(),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl CredentialStore for SqlCredentialStore {
    async fn lookup(&self, credentials: &Credentials) -> Result<i64, AuthError> {
        let row = sqlx::query(self.statement.as_str())
            .bind(&credentials.username)
            .bind(&credentials.password)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| AuthError::Backend(err.to_string()))?
            .ok_or(AuthError::Rejected)?;

        // 有符号与无符号整数列都接受。
        match row.try_get::<i64, _>(0) {
            Ok(id) => Ok(id),
            Err(signed) => match row.try_get::<u64, _>(0) {
                Ok(id) => widen_unsigned(id),
                Err(_) => Err(AuthError::Backend(signed.to_string())),
            },
        }
    }
}

fn widen_unsigned(id: u64) -> Result<i64, AuthError> {
    i64::try_from(id).map_err(|_| AuthError::Backend(format!("identity {id} out of range")))
}

/// 查询凭证并加上配置的 uid 偏移。
pub async fn resolve_identity(
    store: &dyn CredentialStore,
    credentials: &Credentials,
    uid_offset: i64,
) -> Result<Identity, UploadError> {
    let raw = match store.lookup(credentials).await {
        Ok(raw) => raw,
        Err(AuthError::Rejected) => {
            return Err(UploadError::Forbidden(format!(
                "no credential for user {}",
                credentials.username
            )));
        }
        Err(AuthError::Backend(message)) => {
            error!(user = %credentials.username, error = %message, "query credential store");
            return Err(UploadError::Internal(message));
        }
    };

    let uid = raw
        .checked_add(uid_offset)
        .and_then(|value| u32::try_from(value).ok())
        .ok_or_else(|| {
            error!(
                user = %credentials.username,
                raw,
                uid_offset,
                "resolved identity out of range"
            );
            UploadError::Internal(format!("identity {raw}+{uid_offset} out of range"))
        })?;
    Ok(Identity { uid, gid: uid })
}
