//! View, copy, move, rename and working-directory changes.

use std::fs::{self, File, Metadata};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{FileLimits, FileOpError, FileOperations, FileResult};
use crate::sandbox::SandboxError;

/// Symlinks followed before a destination is refused.
const MAX_LINK_HOPS: usize = 40;

/// Kind of a listed directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    Other,
}

impl EntryKind {
    fn tag(self) -> &'static str {
        match self {
            EntryKind::Directory => "[DIR]",
            EntryKind::File => "[FILE]",
            EntryKind::Symlink => "[LINK]",
            EntryKind::Other => "[OTHER]",
        }
    }
}

/// One immediate child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Entry name (not full path).
    pub name: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for anything but regular files).
    pub size: u64,
}

impl ListingEntry {
    /// Render as a listing line, e.g. `[FILE] notes.txt 42 bytes`.
    pub fn to_line(&self) -> String {
        match self.kind {
            EntryKind::File => format!("{} {} {} bytes", self.kind.tag(), self.name, self.size),
            kind => format!("{} {}", kind.tag(), self.name),
        }
    }
}

/// Result of viewing a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    /// A directory's immediate entries, directories first.
    Listing {
        path: String,
        entries: Vec<ListingEntry>,
    },
    /// The head of a regular file.
    File {
        path: String,
        lines: Vec<String>,
        /// More lines follow the ones returned.
        truncated: bool,
    },
}

impl View {
    /// Status line message describing the view.
    pub fn message(&self) -> String {
        match self {
            View::Listing { path, entries } => {
                format!("listing of {} ({} entries)", path, entries.len())
            }
            View::File {
                path,
                lines,
                truncated: true,
            } => format!("content of {} (truncated after {} lines)", path, lines.len()),
            View::File { path, .. } => format!("content of {}", path),
        }
    }

    /// Response body lines.
    pub fn into_body(self) -> Vec<String> {
        match self {
            View::Listing { entries, .. } => entries.iter().map(ListingEntry::to_line).collect(),
            View::File { lines, .. } => lines,
        }
    }
}

/// Result of a copy, move or rename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Root-relative source.
    pub source: String,
    /// Root-relative destination.
    pub destination: String,
    /// Bytes in the file.
    pub bytes: u64,
}

impl FileOperations {
    /// List a directory or return the first lines of a file.
    pub fn view(&self, cwd: &Path, raw: &str) -> FileResult<View> {
        let path = self.sandbox.resolve(cwd, raw)?;
        let metadata = self.stat(&path)?;
        self.check_real(&path)?;

        if metadata.is_dir() {
            let entries = self.list(&path)?;
            debug!(path = %self.display(&path), entries = entries.len(), "Listed directory");
            Ok(View::Listing {
                path: self.display(&path),
                entries,
            })
        } else if metadata.is_file() {
            let (lines, truncated) = read_head(&path, &self.limits)?;
            Ok(View::File {
                path: self.display(&path),
                lines,
                truncated,
            })
        } else {
            // Sockets, FIFOs and devices are not viewable.
            Err(FileOpError::NotFound(self.display(&path)))
        }
    }

    /// Copy a regular file, creating the destination's parents and
    /// overwriting any existing destination file.
    pub fn copy(&self, cwd: &Path, src: &str, dst: &str) -> FileResult<CopyOutcome> {
        let src = self.sandbox.resolve(cwd, src)?;
        let dst = self.sandbox.resolve(cwd, dst)?;
        let _guard = self.lock(&[src.as_path(), dst.as_path()]);

        let bytes = self.source_file(&src)?;
        self.prepare_destination(&dst)?;

        // Copying a file onto itself would truncate it.
        if src != dst {
            fs::copy(&src, &dst).map_err(FileOpError::io("copy", &src))?;
        }

        debug!(src = %self.display(&src), dst = %self.display(&dst), bytes, "Copied file");
        Ok(self.outcome(&src, &dst, bytes))
    }

    /// Move a regular file.
    ///
    /// Uses a rename when possible and falls back to copy-then-delete,
    /// e.g. across filesystems.
    pub fn move_file(&self, cwd: &Path, src: &str, dst: &str) -> FileResult<CopyOutcome> {
        let src = self.sandbox.resolve(cwd, src)?;
        let dst = self.sandbox.resolve(cwd, dst)?;
        let _guard = self.lock(&[src.as_path(), dst.as_path()]);

        self.move_resolved(&src, &dst)
    }

    /// Rename a file.
    ///
    /// `new_name` is resolved against the source's parent directory unless
    /// it is absolute-style, in which case it is taken from the root.
    pub fn rename(&self, cwd: &Path, src: &str, new_name: &str) -> FileResult<CopyOutcome> {
        let src = self.sandbox.resolve(cwd, src)?;
        let dst = if new_name.starts_with(['/', '\\']) {
            self.sandbox.resolve(cwd, new_name)?
        } else {
            let parent = src.parent().unwrap_or_else(|| self.sandbox.root());
            self.sandbox.resolve(parent, new_name)?
        };
        let _guard = self.lock(&[src.as_path(), dst.as_path()]);

        self.move_resolved(&src, &dst)
    }

    /// Resolve a new working directory, creating it if absent.
    ///
    /// Returns the directory for the caller to install; nothing changes
    /// on error.
    pub fn set_directory(&self, cwd: &Path, raw: &str) -> FileResult<PathBuf> {
        let path = self.sandbox.resolve(cwd, raw)?;

        match fs::metadata(&path) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Err(FileOpError::NotADirectory(self.display(&path))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.check_creatable(&path)?;
                fs::create_dir_all(&path).map_err(FileOpError::io("create directory", &path))?;
                debug!(path = %self.display(&path), "Created directory");
            }
            Err(e) => return Err(FileOpError::io("stat", &path)(e)),
        }

        // Re-validate now that the directory exists on disk.
        self.check_real(&path)?;
        Ok(self.sandbox.resolve(&path, ".")?)
    }

    /// Render a working directory relative to the root.
    pub fn pwd(&self, cwd: &Path) -> String {
        self.display(cwd)
    }

    fn move_resolved(&self, src: &Path, dst: &Path) -> FileResult<CopyOutcome> {
        let bytes = self.source_file(src)?;
        self.prepare_destination(dst)?;

        if src != dst {
            if let Err(e) = fs::rename(src, dst) {
                debug!(error = %e, "Rename failed, falling back to copy and delete");
                copy_then_remove(src, dst)?;
            }
        }

        debug!(src = %self.display(src), dst = %self.display(dst), bytes, "Moved file");
        Ok(self.outcome(src, dst, bytes))
    }

    /// Check that `path` is an existing regular file; returns its size.
    pub(super) fn source_file(&self, path: &Path) -> FileResult<u64> {
        let metadata = self.stat(path)?;
        if !metadata.is_file() {
            return Err(FileOpError::NotAFile(self.display(path)));
        }
        self.check_real(path)?;
        Ok(metadata.len())
    }

    /// Refuse directory destinations and create missing parents.
    ///
    /// Confinement is checked before anything is created.
    pub(super) fn prepare_destination(&self, path: &Path) -> FileResult<()> {
        if path.is_dir() {
            return Err(FileOpError::DestinationIsDirectory(self.display(path)));
        }
        self.check_creatable(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(FileOpError::io("create directory", parent))?;
        }
        Ok(())
    }

    fn stat(&self, path: &Path) -> FileResult<Metadata> {
        fs::metadata(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => FileOpError::NotFound(self.display(path)),
            _ => FileOpError::io("stat", path)(e),
        })
    }

    /// Make sure an existing path does not reach outside the root through
    /// a symlink.
    pub(super) fn check_real(&self, path: &Path) -> FileResult<()> {
        match path.canonicalize() {
            Ok(real) if self.sandbox.contains(&real) => Ok(()),
            Ok(_) => Err(SandboxError::Escape.into()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileOpError::io("canonicalize", path)(e)),
        }
    }

    /// Check a path that is about to be written or created.
    ///
    /// An existing path must really lie inside the root. A dangling
    /// symlink is judged by where its target would be created, and a
    /// missing path by its deepest existing ancestor.
    pub(super) fn check_creatable(&self, path: &Path) -> FileResult<()> {
        let mut path = path.to_path_buf();

        for _ in 0..MAX_LINK_HOPS {
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => return self.check_ancestors(&path),
                Err(e) => return Err(FileOpError::io("stat", &path)(e)),
            };
            if !metadata.file_type().is_symlink() {
                return self.check_real(&path);
            }
            match path.canonicalize() {
                Ok(real) if self.sandbox.contains(&real) => return Ok(()),
                Ok(_) => return Err(SandboxError::Escape.into()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(FileOpError::io("canonicalize", &path)(e)),
            }

            // Dangling: writing through the link creates its target.
            let target = fs::read_link(&path).map_err(FileOpError::io("read link", &path))?;
            path = match path.parent() {
                Some(parent) => parent.join(target),
                None => target,
            };
        }

        Err(SandboxError::Escape.into())
    }

    /// The deepest existing ancestor of `path` must lie inside the root.
    fn check_ancestors(&self, path: &Path) -> FileResult<()> {
        for ancestor in path.ancestors().skip(1) {
            match ancestor.canonicalize() {
                Ok(real) if self.sandbox.contains(&real) => return Ok(()),
                Ok(_) => return Err(SandboxError::Escape.into()),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(FileOpError::io("canonicalize", ancestor)(e)),
            }
        }
        Err(SandboxError::Escape.into())
    }

    fn list(&self, path: &Path) -> FileResult<Vec<ListingEntry>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(path).map_err(FileOpError::io("read directory", path))? {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue, // Skip entries we can't read
            };
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };

            let file_type = metadata.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };

            entries.push(ListingEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
                size: if kind == EntryKind::File {
                    metadata.len()
                } else {
                    0
                },
            });
        }

        // Directories first, then case-insensitive by name
        entries.sort_by(|a, b| {
            let a_dir = a.kind == EntryKind::Directory;
            let b_dir = b.kind == EntryKind::Directory;
            b_dir
                .cmp(&a_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });

        Ok(entries)
    }

    fn outcome(&self, src: &Path, dst: &Path, bytes: u64) -> CopyOutcome {
        CopyOutcome {
            source: self.display(src),
            destination: self.display(dst),
            bytes,
        }
    }
}

/// Move by copying then deleting the source.
///
/// If the source cannot be removed both copies remain and the error is
/// returned.
fn copy_then_remove(src: &Path, dst: &Path) -> FileResult<()> {
    fs::copy(src, dst).map_err(FileOpError::io("copy", src))?;
    fs::remove_file(src).map_err(FileOpError::io("remove", src))
}

/// Read the head of a file, decoding lossily.
///
/// At most `view_max_lines` lines are returned, each cut to
/// `view_max_line_bytes`, and no more than `max_transfer_size` bytes are
/// read in total. The flag is set when anything was left out.
fn read_head(path: &Path, limits: &FileLimits) -> FileResult<(Vec<String>, bool)> {
    let file = File::open(path).map_err(FileOpError::io("open", path))?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    let mut budget = limits.max_transfer_size;
    let line_cap = limits.view_max_line_bytes;

    loop {
        buf.clear();
        // Room for "\r\n", so a line of exactly `line_cap` bytes is kept whole.
        let limit = (line_cap as u64 + 2).min(budget);
        let read = (&mut reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .map_err(FileOpError::io("read", path))?;
        if read == 0 {
            let more = budget == 0 && has_more(&mut reader, path)?;
            return Ok((lines, more));
        }
        if lines.len() == limits.view_max_lines {
            return Ok((lines, true));
        }
        budget -= read as u64;

        let complete = buf.last() == Some(&b'\n');
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }

        let mut line = String::from_utf8_lossy(&buf).into_owned();
        if line.len() > line_cap {
            let mut end = line_cap;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            line.truncate(end);
            lines.push(line);
            return Ok((lines, true));
        }
        lines.push(line);

        if !complete && (budget == 0 || read as u64 == limit) {
            let more = has_more(&mut reader, path)?;
            return Ok((lines, more));
        }
    }
}

fn has_more(reader: &mut BufReader<File>, path: &Path) -> FileResult<bool> {
    let available = reader.fill_buf().map_err(FileOpError::io("read", path))?;
    Ok(!available.is_empty())
}
