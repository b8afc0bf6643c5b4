//! Whole-file transfer encoded as base64.
//!
//! Downloads come back as fixed-width base64 body lines together with the
//! file's SHA-256 digest. Uploads arrive as a single base64 argument and
//! are written atomically through a temp file in the destination
//! directory.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{FileOpError, FileOperations, FileResult};

/// Characters per base64 body line in a download.
pub const BASE64_LINE_WIDTH: usize = 76;

/// A downloaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// Root-relative path.
    pub path: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the content.
    pub sha256: String,
    /// Base64 content split into [`BASE64_LINE_WIDTH`] lines.
    pub lines: Vec<String>,
}

/// A stored upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Root-relative path.
    pub path: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the content.
    pub sha256: String,
}

impl FileOperations {
    /// Read a whole regular file for transfer.
    pub fn download(&self, cwd: &Path, raw: &str) -> FileResult<Download> {
        let path = self.sandbox.resolve(cwd, raw)?;
        let size = self.source_file(&path)?;

        let limit = self.limits.max_transfer_size;
        if size > limit {
            return Err(FileOpError::FileTooLarge { size, limit });
        }

        let mut data = Vec::with_capacity(size as usize);
        File::open(&path)
            .and_then(|mut file| file.read_to_end(&mut data))
            .map_err(FileOpError::io("read", &path))?;

        let encoded = STANDARD.encode(&data);
        let lines = encoded
            .as_bytes()
            .chunks(BASE64_LINE_WIDTH)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect();

        debug!(path = %self.display(&path), size = data.len(), "Prepared download");
        Ok(Download {
            path: self.display(&path),
            size: data.len() as u64,
            sha256: hex::encode(Sha256::digest(&data)),
            lines,
        })
    }

    /// Store a base64 payload at `raw`, creating parents and overwriting
    /// any existing file.
    pub fn upload(&self, cwd: &Path, raw: &str, payload: &str) -> FileResult<Upload> {
        let path = self.sandbox.resolve(cwd, raw)?;

        let limit = self.limits.max_transfer_size;
        // Decoded size is at most 3/4 of the encoded length.
        let estimate = (payload.len() as u64 / 4) * 3;
        if estimate > limit {
            return Err(FileOpError::FileTooLarge {
                size: estimate,
                limit,
            });
        }

        let data = STANDARD
            .decode(payload.trim())
            .map_err(|_| FileOpError::InvalidPayload)?;
        let size = data.len() as u64;
        if size > limit {
            return Err(FileOpError::FileTooLarge { size, limit });
        }

        let _guard = self.lock(&[path.as_path()]);
        self.prepare_destination(&path)?;
        write_atomic(&path, &data)?;

        let stored = hash_file(&path).map_err(FileOpError::io("hash", &path))?;
        if stored[..] != Sha256::digest(&data)[..] {
            return Err(FileOpError::io("verify", &path)(io::Error::new(
                io::ErrorKind::InvalidData,
                "stored content does not match the upload",
            )));
        }

        debug!(path = %self.display(&path), size, "Stored upload");
        Ok(Upload {
            path: self.display(&path),
            size,
            sha256: hex::encode(stored),
        })
    }
}

/// Write through a temp file next to `path`, then rename over it.
fn write_atomic(path: &Path, data: &[u8]) -> FileResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.{}.upload", file_name, Uuid::new_v4()));

    let written = File::create(&temp_path)
        .and_then(|mut file| {
            file.write_all(data)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&temp_path, path));

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            warn!(
                path = ?temp_path,
                error = %cleanup,
                "Failed to cleanup temp file after failed upload"
            );
        }
        return Err(FileOpError::io("write", path)(e));
    }
    Ok(())
}

/// SHA-256 of a file as stored on disk.
fn hash_file(path: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileLimits;
    use crate::sandbox::{PathSandbox, SandboxError, ServerRoot};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup(max_transfer_size: u64) -> (TempDir, FileOperations, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = ServerRoot::new(temp_dir.path().join("root")).unwrap();
        let root_path = root.path().to_path_buf();
        let ops = FileOperations::new(
            PathSandbox::new(root),
            FileLimits {
                view_max_lines: 100,
                view_max_line_bytes: 1024,
                max_transfer_size,
            },
        );
        (temp_dir, ops, root_path)
    }

    #[test]
    fn test_download() {
        let (_tmp, ops, root) = setup(4096);
        let content = vec![7u8; 100];
        fs::write(root.join("blob.bin"), &content).unwrap();

        let download = ops.download(&root, "blob.bin").unwrap();
        assert_eq!(download.path, "/blob.bin");
        assert_eq!(download.size, 100);
        assert!(download.lines.iter().all(|l| l.len() <= BASE64_LINE_WIDTH));
        assert_eq!(download.lines.len(), 2);

        let decoded = STANDARD.decode(download.lines.concat()).unwrap();
        assert_eq!(decoded, content);
        assert_eq!(
            download.sha256,
            hex::encode(hash_file(&root.join("blob.bin")).unwrap())
        );
    }

    #[test]
    fn test_download_empty_file() {
        let (_tmp, ops, root) = setup(4096);
        fs::write(root.join("empty"), b"").unwrap();

        let download = ops.download(&root, "empty").unwrap();
        assert_eq!(download.size, 0);
        assert!(download.lines.is_empty());
    }

    #[test]
    fn test_download_too_large() {
        let (_tmp, ops, root) = setup(10);
        fs::write(root.join("big"), vec![0u8; 11]).unwrap();

        assert!(matches!(
            ops.download(&root, "big").unwrap_err(),
            FileOpError::FileTooLarge { size: 11, limit: 10 }
        ));
    }

    #[test]
    fn test_download_directory() {
        let (_tmp, ops, root) = setup(10);
        fs::create_dir(root.join("dir")).unwrap();
        assert!(matches!(
            ops.download(&root, "dir").unwrap_err(),
            FileOpError::NotAFile(_)
        ));
    }

    #[test]
    fn test_upload_creates_and_overwrites() {
        let (_tmp, ops, root) = setup(4096);

        let upload = ops
            .upload(&root, "inbox/hello.txt", &STANDARD.encode(b"hello"))
            .unwrap();
        assert_eq!(upload.path, "/inbox/hello.txt");
        assert_eq!(upload.size, 5);
        assert_eq!(upload.sha256, hex::encode(Sha256::digest(b"hello")));
        assert_eq!(fs::read(root.join("inbox/hello.txt")).unwrap(), b"hello");

        ops.upload(&root, "inbox/hello.txt", &STANDARD.encode(b"bye"))
            .unwrap();
        assert_eq!(fs::read(root.join("inbox/hello.txt")).unwrap(), b"bye");

        // No temp files are left behind.
        let names: Vec<_> = fs::read_dir(root.join("inbox"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_upload_invalid_payload() {
        let (_tmp, ops, root) = setup(4096);
        assert!(matches!(
            ops.upload(&root, "x.txt", "not*base64!").unwrap_err(),
            FileOpError::InvalidPayload
        ));
        assert!(!root.join("x.txt").exists());
    }

    #[test]
    fn test_upload_too_large() {
        let (_tmp, ops, root) = setup(4);
        let err = ops
            .upload(&root, "x.txt", &STANDARD.encode(b"0123456789"))
            .unwrap_err();
        assert!(matches!(err, FileOpError::FileTooLarge { limit: 4, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_upload_through_dangling_symlink_is_refused() {
        let (tmp, ops, root) = setup(4096);
        let victim = tmp.path().join("victim.txt");
        std::os::unix::fs::symlink(&victim, root.join("drop.txt")).unwrap();

        let err = ops
            .upload(&root, "drop.txt", &STANDARD.encode(b"x"))
            .unwrap_err();
        assert!(matches!(err, FileOpError::Sandbox(SandboxError::Escape)));
        assert!(!victim.exists());
    }

    #[test]
    fn test_hash_file_matches_upload_digest() {
        let (_tmp, ops, root) = setup(4096);
        let upload = ops
            .upload(&root, "nested/h.txt", &STANDARD.encode(b"digest me"))
            .unwrap();
        let on_disk = hash_file(&root.join("nested/h.txt")).unwrap();
        assert_eq!(upload.sha256, hex::encode(&on_disk));
        assert_eq!(on_disk, Sha256::digest(b"digest me").to_vec());
    }

    #[test]
    fn test_upload_escape() {
        let (tmp, ops, root) = setup(4096);
        let err = ops
            .upload(&root, "../evil.txt", &STANDARD.encode(b"x"))
            .unwrap_err();
        assert!(matches!(err, FileOpError::Sandbox(SandboxError::Escape)));
        assert!(!tmp.path().join("evil.txt").exists());
    }
}
