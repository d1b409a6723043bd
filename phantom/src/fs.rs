//! Filesystem bridge exposed to scripts as `fs`.
//!
//! Every operation is synchronous and best-effort: failures come back as
//! `false`, `-1`, `None` or an empty value, never as an error. Scripts are
//! expected to check return values; the bootstrap layer adds throwing
//! wrappers where that is more convenient.

use std::cell::RefCell;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};
use std::rc::Rc;
use std::time::UNIX_EPOCH;

/// How a file is opened by [`FileSystem::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
    ReadWrite,
}

impl OpenMode {
    /// `r`, `w`, `a` (or `+`), and `rw` (or `r+`).
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "r" => Some(OpenMode::Read),
            "w" => Some(OpenMode::Write),
            "a" | "+" => Some(OpenMode::Append),
            "rw" | "r+" => Some(OpenMode::ReadWrite),
            _ => None,
        }
    }

    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
            OpenMode::ReadWrite => options.read(true).write(true).create(true),
        };
        options
    }
}

struct Stream {
    reader: Option<BufReader<fs::File>>,
    writer: Option<BufWriter<fs::File>>,
}

/// Open file handed to scripts. Clones refer to the same stream; after
/// [`File::close`] every operation is a no-op.
#[derive(Clone)]
pub struct File {
    stream: Rc<RefCell<Option<Stream>>>,
}

impl File {
    fn open(path: &Path, mode: OpenMode) -> std::io::Result<Self> {
        let file = mode.options().open(path)?;
        let stream = match mode {
            OpenMode::Read => Stream {
                reader: Some(BufReader::new(file)),
                writer: None,
            },
            OpenMode::Write | OpenMode::Append => Stream {
                reader: None,
                writer: Some(BufWriter::new(file)),
            },
            OpenMode::ReadWrite => Stream {
                reader: Some(BufReader::new(file.try_clone()?)),
                writer: Some(BufWriter::new(file)),
            },
        };
        Ok(Self {
            stream: Rc::new(RefCell::new(Some(stream))),
        })
    }

    /// Rest of the stream; empty when not readable.
    pub fn read(&mut self) -> String {
        let mut stream = self.stream.borrow_mut();
        let Some(reader) = stream.as_mut().and_then(|s| s.reader.as_mut()) else {
            return String::new();
        };
        let mut bytes = Vec::new();
        if reader.read_to_end(&mut bytes).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Next line without its terminator; empty at end of stream.
    pub fn read_line(&mut self) -> String {
        let mut stream = self.stream.borrow_mut();
        let Some(reader) = stream.as_mut().and_then(|s| s.reader.as_mut()) else {
            return String::new();
        };
        let mut bytes = Vec::new();
        if reader.read_until(b'\n', &mut bytes).is_err() {
            return String::new();
        }
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// In `rw` mode the data lands at the current read position and is
    /// flushed right away, so the next read continues after it.
    pub fn write(&mut self, data: &str) -> bool {
        let mut stream = self.stream.borrow_mut();
        let Some(stream) = stream.as_mut() else {
            return false;
        };
        let Some(writer) = stream.writer.as_mut() else {
            return false;
        };
        let Some(reader) = stream.reader.as_mut() else {
            return writer.write_all(data.as_bytes()).is_ok();
        };
        // Both halves share one OS offset; drop the read-ahead first.
        reader
            .stream_position()
            .and_then(|pos| reader.seek(SeekFrom::Start(pos)))
            .and_then(|_| writer.write_all(data.as_bytes()))
            .and_then(|_| writer.flush())
            .is_ok()
    }

    pub fn write_line(&mut self, data: &str) -> bool {
        self.write(data) && self.write("\n")
    }

    /// True when nothing is left to read, or the file is not readable.
    pub fn at_end(&mut self) -> bool {
        let mut stream = self.stream.borrow_mut();
        match stream.as_mut().and_then(|s| s.reader.as_mut()) {
            Some(reader) => reader.fill_buf().map(|buf| buf.is_empty()).unwrap_or(true),
            None => true,
        }
    }

    pub fn flush(&mut self) {
        let mut stream = self.stream.borrow_mut();
        if let Some(writer) = stream.as_mut().and_then(|s| s.writer.as_mut()) {
            let _ = writer.flush();
        }
    }

    pub fn close(&mut self) {
        self.flush();
        self.stream.borrow_mut().take();
    }
}

/// Capability object exposing local filesystem operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystem;

impl FileSystem {
    pub fn new() -> Self {
        Self
    }

    /// Size in bytes, or -1 when the path cannot be inspected.
    pub fn size(&self, path: &str) -> i64 {
        fs::metadata(path).map(|m| m.len() as i64).unwrap_or(-1)
    }

    /// Last modification time in milliseconds since the Unix epoch.
    pub fn last_modified(&self, path: &str) -> Option<i64> {
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
        let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
        Some(since_epoch.as_millis() as i64)
    }

    /// Create one directory level. Fails when it already exists.
    pub fn make_directory(&self, path: &str) -> bool {
        fs::create_dir(path).is_ok()
    }

    /// Create a directory and any missing parents.
    pub fn make_tree(&self, path: &str) -> bool {
        fs::create_dir_all(path).is_ok()
    }

    /// Remove an empty directory.
    pub fn remove_directory(&self, path: &str) -> bool {
        fs::remove_dir(path).is_ok()
    }

    /// Remove a directory and everything below it.
    pub fn remove_tree(&self, path: &str) -> bool {
        Path::new(path).is_dir() && fs::remove_dir_all(path).is_ok()
    }

    /// Remove a file.
    pub fn remove(&self, path: &str) -> bool {
        Path::new(path).is_file() && fs::remove_file(path).is_ok()
    }

    pub fn open(&self, path: &str, mode: &str) -> Option<File> {
        let mode = OpenMode::parse(mode)?;
        match File::open(Path::new(path), mode) {
            Ok(file) => Some(file),
            Err(err) => {
                log::debug!("fs: cannot open '{}' ({:?}): {}", path, mode, err);
                None
            }
        }
    }

    /// Directory entries, `.` and `..` first, then names in sorted order.
    /// Empty when `path` is not a readable directory.
    pub fn list(&self, path: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(path) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        let mut listing = vec![".".to_string(), "..".to_string()];
        listing.extend(names);
        listing
    }

    pub fn separator(&self) -> String {
        MAIN_SEPARATOR.to_string()
    }

    pub fn working_directory(&self) -> String {
        env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default()
    }

    pub fn change_working_directory(&self, path: &str) -> bool {
        env::set_current_dir(path).is_ok()
    }

    /// Absolute, lexically normalized form of `path` against the working
    /// directory.
    pub fn absolute(&self, path: &str) -> String {
        absolute_path(Path::new(path)).display().to_string()
    }

    pub fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    pub fn is_directory(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }

    pub fn is_file(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }
}

/// Join `path` onto the working directory (when relative) and drop `.` and
/// `..` components without touching the filesystem.
pub fn absolute_path(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().unwrap_or_default().join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
