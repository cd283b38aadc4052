//! 本地写入：以调用者的 uid/gid 重新执行自身，由子进程完成落盘。

use std::fs::{File, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempPath;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info};

use crate::auth::Identity;
use crate::body::UploadStream;
use crate::error::UploadError;
use crate::helper::{EXIT_UNAUTHORIZED, WRITE_SENTINEL};

const EXE_COPY_PREFIX: &str = "upload-gateway-";

/// 每次写入时重新执行的二进制映像。
#[derive(Debug)]
pub struct ExecutableImage {
    path: PathBuf,
    // Removes the private copy when the server exits.
    _copy: Option<TempPath>,
}

impl ExecutableImage {
    /// 使用当前可执行文件；`copy` 为 true 时使用其私有副本。
    pub fn current(copy: bool) -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        if !copy {
            return Ok(Self::from_path(exe));
        }

        let mut source = File::open(&exe)?;
        let mut temp = tempfile::Builder::new()
            .prefix(EXE_COPY_PREFIX)
            .permissions(Permissions::from_mode(0o755))
            .tempfile()?;
        io::copy(&mut source, temp.as_file_mut())?;
        temp.as_file().sync_all()?;
        // Close the handle so the copy can be executed.
        let copy = temp.into_temp_path();
        info!(from = %exe.display(), to = %copy.display(), "copied executable image");
        Ok(Self {
            path: copy.to_path_buf(),
            _copy: Some(copy),
        })
    }

    pub fn from_path(path: PathBuf) -> Self {
        Self { path, _copy: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 通过以请求身份运行的写入子进程，把上传写到 `root` 之下。
#[derive(Debug)]
pub struct LocalWriter {
    image: ExecutableImage,
    root: PathBuf,
    timeout: Option<Duration>,
}

impl LocalWriter {
    pub fn new(image: ExecutableImage, root: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            image,
            root,
            timeout,
        }
    }

    /// 以 `identity` 身份把 `stream` 写入 `root/relative`，成功时返回目标绝对路径。
    pub async fn write(
        &self,
        identity: Identity,
        relative: &str,
        mut stream: UploadStream,
    ) -> Result<PathBuf, UploadError> {
        let target = self.root.join(relative);
        let mut child = Command::new(self.image.path())
            .arg(WRITE_SENTINEL)
            .arg(&target)
            .uid(identity.uid)
            .gid(identity.gid)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                error!(path = %target.display(), error = %err, "fork self for writing");
                UploadError::Internal(err.to_string())
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UploadError::Internal("write helper stdin not piped".into()))?;

        let outcome = feed_and_wait(&mut child, stdin, &mut stream);
        let (copied, status) = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, outcome).await.map_err(|_| {
                error!(
                    path = %target.display(),
                    timeout_secs = limit.as_secs(),
                    "write helper timed out"
                );
                UploadError::Internal("write helper timed out".into())
            })?,
            None => outcome.await,
        };

        let status = status.map_err(|err| {
            error!(path = %target.display(), error = %err, "wait for write helper");
            UploadError::Internal(err.to_string())
        })?;
        match status.code() {
            Some(0) => {}
            Some(code) if code == i32::from(EXIT_UNAUTHORIZED) => {
                return Err(UploadError::Forbidden(format!(
                    "uid {} may not write {}",
                    identity.uid,
                    target.display()
                )));
            }
            _ => {
                error!(path = %target.display(), %status, "fork self exit");
                return Err(UploadError::Internal(format!("write helper {status}")));
            }
        }

        let written = copied.map_err(|err| {
            error!(path = %target.display(), error = %err, "stream upload to write helper");
            UploadError::Internal(err.to_string())
        })?;
        debug!(path = %target.display(), bytes = written, uid = identity.uid, "local write done");
        Ok(target)
    }
}

async fn feed_and_wait(
    child: &mut Child,
    mut stdin: ChildStdin,
    stream: &mut UploadStream,
) -> (io::Result<u64>, io::Result<ExitStatus>) {
    let copied = tokio::io::copy(stream, &mut stdin).await;
    // EOF for the helper.
    drop(stdin);
    (copied, child.wait().await)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::{TempDir, tempdir};

    /// Stands in for the re-executed binary: same argv and exit codes.
    const HELPER_SCRIPT: &str = r#"#!/bin/sh
[ "$1" = "@@UPLOAD@@GATEWAY@@WRITE@@" ] || exit 2
mkdir -p "$(dirname "$2")" || exit 127
cat > "$2" || exit 1
"#;

    pub(crate) fn install_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("helper.sh");
        std::fs::write(&path, body).expect("write script");
        std::fs::set_permissions(&path, Permissions::from_mode(0o755)).expect("chmod script");
        path
    }

    pub(crate) fn own_identity(dir: &Path) -> Identity {
        let metadata = std::fs::metadata(dir).expect("metadata");
        Identity {
            uid: metadata.uid(),
            gid: metadata.gid(),
        }
    }

    fn writer(script: &str, timeout: Option<Duration>) -> (TempDir, LocalWriter) {
        let temp = tempdir().expect("tempdir");
        let program = install_script(temp.path(), script);
        let root = temp.path().join("storage");
        (
            temp,
            LocalWriter::new(ExecutableImage::from_path(program), root, timeout),
        )
    }

    fn stream(content: &'static [u8]) -> UploadStream {
        Box::pin(content)
    }

    #[tokio::test]
    async fn helper_writes_nested_file() {
        let (temp, writer) = writer(HELPER_SCRIPT, None);
        let identity = own_identity(temp.path());
        let target = writer
            .write(identity, "a/b/c.txt", stream(b"hello"))
            .await
            .unwrap_or_else(|_| panic!("write failed"));
        assert_eq!(target, temp.path().join("storage/a/b/c.txt"));
        assert_eq!(std::fs::read(&target).expect("read"), b"hello");
    }

    #[tokio::test]
    async fn repeated_write_yields_same_bytes() {
        let (temp, writer) = writer(HELPER_SCRIPT, None);
        let identity = own_identity(temp.path());
        for _ in 0..2 {
            writer
                .write(identity, "f.txt", stream(b"same"))
                .await
                .unwrap_or_else(|_| panic!("write failed"));
        }
        let stored = std::fs::read(temp.path().join("storage/f.txt")).expect("read");
        assert_eq!(stored, b"same");
    }

    #[tokio::test]
    async fn unauthorized_exit_maps_to_forbidden() {
        let (temp, writer) = writer("#!/bin/sh\nexit 127\n", None);
        let result = writer
            .write(own_identity(temp.path()), "f.txt", stream(b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::Forbidden(_))));
    }

    #[tokio::test]
    async fn generic_exit_maps_to_internal() {
        let (temp, writer) = writer("#!/bin/sh\ncat >/dev/null\nexit 1\n", None);
        let result = writer
            .write(own_identity(temp.path()), "f.txt", stream(b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::Internal(_))));
    }

    #[tokio::test]
    async fn missing_program_maps_to_internal() {
        let temp = tempdir().expect("tempdir");
        let writer = LocalWriter::new(
            ExecutableImage::from_path(temp.path().join("missing")),
            temp.path().to_path_buf(),
            None,
        );
        let result = writer
            .write(own_identity(temp.path()), "f.txt", stream(b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::Internal(_))));
    }

    #[tokio::test]
    async fn hung_helper_is_bounded() {
        let (temp, writer) = writer(
            "#!/bin/sh\nsleep 5\n",
            Some(Duration::from_millis(200)),
        );
        let result = writer
            .write(own_identity(temp.path()), "f.txt", stream(b"x"))
            .await;
        assert!(matches!(result, Err(UploadError::Internal(_))));
    }

    #[test]
    fn executable_copy_is_private_and_removed() {
        let original = std::env::current_exe().expect("current exe");
        let image = ExecutableImage::current(true).expect("copy exe");
        let copy = image.path().to_path_buf();
        assert_ne!(copy, original);
        let metadata = std::fs::metadata(&copy).expect("copy metadata");
        assert_eq!(
            metadata.len(),
            std::fs::metadata(&original).expect("metadata").len()
        );
        assert_eq!(metadata.permissions().mode() & 0o700, 0o700);
        drop(image);
        assert!(!copy.exists());
    }
}
