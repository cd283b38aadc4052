//! 写入子进程模式：以降权身份把 stdin 写入目标文件。
//!
//! The server re-executes its own image as
//! `<exe> WRITE_SENTINEL <absolute path>` with the caller's uid/gid. In that
//! mode the process never starts the HTTP server; it runs [`run`] and exits
//! with one of the codes below.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;
use tracing::{debug, error};

pub const WRITE_SENTINEL: &str = "@@UPLOAD@@GATEWAY@@WRITE@@";

/// 创建目录或打开文件被拒绝。
pub const EXIT_UNAUTHORIZED: u8 = 127;
/// 打开文件之后的任何失败。
pub const EXIT_FAILURE: u8 = 1;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("make dir for path {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("open file at path {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("copy to file at path {path}: {source}")]
    Copy { path: PathBuf, source: io::Error },
}

impl WriteError {
    pub fn exit_code(&self) -> u8 {
        match self {
            WriteError::CreateDir { .. } | WriteError::Open { .. } => EXIT_UNAUTHORIZED,
            WriteError::Copy { .. } => EXIT_FAILURE,
        }
    }
}

/// 参数表示写入模式时返回目标路径。
pub fn helper_target<I>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter().skip(1);
    match (args.next(), args.next(), args.next()) {
        (Some(sentinel), Some(path), None) if sentinel == WRITE_SENTINEL => {
            Some(PathBuf::from(path))
        }
        _ => None,
    }
}

/// 创建缺失的父目录，截断或新建 `path` 并写入 `reader` 的内容。
/// 目录权限 0777、文件 0666，均受 umask 约束。
pub fn write_from<R: Read + ?Sized>(reader: &mut R, path: &Path) -> Result<u64, WriteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| WriteError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| WriteError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let copy_error = |source: io::Error| WriteError::Copy {
        path: path.to_path_buf(),
        source,
    };
    let written = io::copy(reader, &mut file).map_err(copy_error)?;
    file.sync_all().map_err(copy_error)?;
    Ok(written)
}

/// 写入模式入口：把 stdin 写入 `path`。
pub fn run(path: &Path) -> ExitCode {
    let mut stdin = io::stdin().lock();
    match write_from(&mut stdin, path) {
        Ok(written) => {
            debug!(path = %path.display(), bytes = written, "write helper finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "write helper failed");
            ExitCode::from(err.exit_code())
        }
    }
}
