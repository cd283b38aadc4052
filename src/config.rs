//! CLI 参数与 YAML 配置文件加载、校验。

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::routes::{RouteRule, RouteTable};
use crate::template::{Template, TemplateError};

pub const DEFAULT_CONFIG_PATH: &str = "upload-gateway.yml";
pub const DEFAULT_SQL_PORT: u16 = 3306;
pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_FTP_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 60 * 60;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "upload-gateway", version, about = "Authenticated HTTP upload gateway")]
pub struct Args {
    #[arg(
        short = 'c',
        long,
        env = "UPLOAD_GATEWAY_CONFIG",
        default_value = DEFAULT_CONFIG_PATH,
        help = "Path to the YAML configuration file"
    )]
    pub config: PathBuf,
    #[arg(
        short = 'b',
        long,
        env = "UPLOAD_GATEWAY_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "UPLOAD_GATEWAY_PORT",
        help = "Listen port (overrides the config file)"
    )]
    pub port: Option<u16>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid route pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        source: regex_lite::Error,
    },

    #[error("invalid url template: {0}")]
    Template(#[from] TemplateError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// 配置文件的原始结构。
#[derive(Deserialize, Debug)]
pub struct FileConfig {
    pub port: u16,
    pub backend: BackendConfig,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local(LocalConfig),
    Ftp(FtpConfig),
}

#[derive(Deserialize, Debug)]
pub struct LocalConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub uid_offset: i64,
    pub url: String,
    #[serde(default)]
    pub copy_exe: bool,
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    pub sql: SqlConfig,
}

#[derive(Deserialize, Debug)]
pub struct SqlConfig {
    pub host: String,
    #[serde(default = "default_sql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub db: String,
    pub request: String,
}

#[derive(Deserialize, Debug)]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_ftp_port")]
    pub port: u16,
    #[serde(default = "default_ftp_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Deserialize, Debug)]
pub struct RouteConfig {
    pub pattern: String,
    pub url: String,
}

fn default_write_timeout_secs() -> u64 {
    DEFAULT_WRITE_TIMEOUT_SECS
}

fn default_sql_port() -> u16 {
    DEFAULT_SQL_PORT
}

fn default_ftp_port() -> u16 {
    DEFAULT_FTP_PORT
}

fn default_ftp_timeout_secs() -> u64 {
    DEFAULT_FTP_TIMEOUT_SECS
}

/// 校验后的只读配置。
#[derive(Debug)]
pub struct GatewayConfig {
    pub port: u16,
    pub backend: BackendSettings,
}

#[derive(Debug)]
pub enum BackendSettings {
    Local(LocalSettings),
    Ftp(FtpSettings),
}

#[derive(Debug)]
pub struct LocalSettings {
    pub root: PathBuf,
    pub uid_offset: i64,
    pub url_prefix: String,
    pub copy_exe: bool,
    /// `None` 表示无限等待写入子进程。
    pub write_timeout: Option<Duration>,
    pub sql: SqlConfig,
}

#[derive(Debug)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub routes: RouteTable,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw: FileConfig = serde_yaml::from_str(content)?;
        raw.validate()
    }
}

impl FileConfig {
    fn validate(self) -> Result<GatewayConfig, ConfigError> {
        let backend = match self.backend {
            BackendConfig::Local(local) => {
                if local.path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid("backend.path is required".into()));
                }
                if local.url.trim().is_empty() {
                    return Err(ConfigError::Invalid("backend.url is required".into()));
                }
                if local.sql.request.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "backend.sql.request is required".into(),
                    ));
                }
                BackendSettings::Local(LocalSettings {
                    root: local.path,
                    uid_offset: local.uid_offset,
                    url_prefix: local.url,
                    copy_exe: local.copy_exe,
                    write_timeout: (local.write_timeout_secs > 0)
                        .then(|| Duration::from_secs(local.write_timeout_secs)),
                    sql: local.sql,
                })
            }
            BackendConfig::Ftp(ftp) => {
                if ftp.host.trim().is_empty() {
                    return Err(ConfigError::Invalid("backend.host is required".into()));
                }
                let mut rules = Vec::with_capacity(ftp.routes.len());
                for route in ftp.routes {
                    let pattern = regex_lite::Regex::new(&route.pattern).map_err(|source| {
                        ConfigError::Pattern {
                            pattern: route.pattern.clone(),
                            source,
                        }
                    })?;
                    rules.push(RouteRule::new(pattern, Template::parse(&route.url)?));
                }
                BackendSettings::Ftp(FtpSettings {
                    host: ftp.host,
                    port: ftp.port,
                    timeout: Duration::from_secs(ftp.timeout_secs),
                    routes: RouteTable::new(rules),
                })
            }
        };

        Ok(GatewayConfig {
            port: self.port,
            backend,
        })
    }
}
