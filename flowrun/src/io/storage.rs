//! Storage backends for the run tree.
//!
//! Every read and write of instance state goes through [`Storage`], so the
//! instance store, runner and report builder can be exercised against
//! [`MemoryStorage`] in tests. Paths handed to a backend are relative to its
//! root (absolute paths are used as-is by [`FsStorage`]).
//!
//! Concurrency contract shared by all backends:
//! - `create_dir` is create-if-absent and treats "already exists" as success.
//! - `write_atomic` never exposes a partially written file.
//! - `create_new` is exclusive: exactly one caller wins.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Storage: Send + Sync {
    /// Create `path` and any missing parents.
    ///
    /// Returns `true` if this call created the directory, `false` if it
    /// already existed.
    fn create_dir(&self, path: &Path) -> io::Result<bool>;

    fn is_dir(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Read a text artifact, replacing invalid UTF-8.
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let bytes = self.read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Replace `path` with `contents` (temp file + rename).
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Create `path` only if it does not exist. Returns `false` if it did.
    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<bool>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Truncate `path` and return an append-only writer for it.
    fn open_log(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Names of the child directories of `path`, sorted. Missing is empty.
    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Real filesystem location of `path`, if the backend has one.
    fn local_path(&self, path: &Path) -> Option<PathBuf>;
}

/// Filesystem backend rooted at a project directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Storage for FsStorage {
    fn create_dir(&self, path: &Path) -> io::Result<bool> {
        create_dir_exclusive(&self.resolve(path))
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.resolve(path).is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        self.resolve(path).is_file()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let full = self.resolve(path);
        let parent = full
            .parent()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "path has no parent"))?;
        create_dir_exclusive(parent)?;
        let file_name = full
            .file_name()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy()
            .into_owned();
        let tmp = parent.join(format!(".{file_name}.{}.tmp", unique_suffix()));
        fs::write(&tmp, contents)?;
        if let Err(err) = fs::rename(&tmp, &full) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        Ok(())
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<bool> {
        let full = self.resolve(path);
        match OpenOptions::new().write(true).create_new(true).open(&full) {
            Ok(mut file) => {
                file.write_all(contents)?;
                file.flush()?;
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn open_log(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let full = self.resolve(path);
        File::create(&full)?;
        let file = OpenOptions::new().append(true).open(&full)?;
        Ok(Box::new(file))
    }

    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>> {
        let full = self.resolve(path);
        let entries = match fs::read_dir(&full) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn local_path(&self, path: &Path) -> Option<PathBuf> {
        Some(self.resolve(path))
    }
}

/// `mkdir -p` that tolerates concurrent creators.
fn create_dir_exclusive(path: &Path) -> io::Result<bool> {
    match fs::create_dir(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => existing_dir(path, err),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
                return Err(err);
            };
            create_dir_exclusive(parent)?;
            match fs::create_dir(path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => existing_dir(path, err),
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

fn existing_dir(path: &Path, err: io::Error) -> io::Result<bool> {
    if path.is_dir() { Ok(false) } else { Err(err) }
}

fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{}.{nanos}", std::process::id())
}

/// In-memory backend. Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, Vec<u8>>,
}

impl MemoryState {
    fn parent_exists(&self, path: &Path) -> bool {
        match path.parent() {
            None => true,
            Some(parent) if parent.as_os_str().is_empty() => true,
            Some(parent) => self.dirs.contains(parent),
        }
    }

    fn ensure_writable(&self, path: &Path) -> io::Result<()> {
        if !self.parent_exists(path) {
            return Err(io::Error::new(
                ErrorKind::NotFound,
                format!("parent of {} does not exist", path.display()),
            ));
        }
        if self.dirs.contains(path) {
            return Err(io::Error::new(
                ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            ));
        }
        Ok(())
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All file paths, sorted. Test helper.
    pub fn files(&self) -> Vec<PathBuf> {
        self.state().files.keys().cloned().collect()
    }
}

impl Storage for MemoryStorage {
    fn create_dir(&self, path: &Path) -> io::Result<bool> {
        let mut state = self.state();
        if state.files.contains_key(path) {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} exists and is a file", path.display()),
            ));
        }
        for ancestor in path.ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() {
                state.dirs.insert(ancestor.to_path_buf());
            }
        }
        Ok(state.dirs.insert(path.to_path_buf()))
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.state().dirs.contains(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.state().files.contains_key(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.state().files.get(path).cloned().ok_or_else(|| {
            io::Error::new(ErrorKind::NotFound, format!("{} not found", path.display()))
        })
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut state = self.state();
        for ancestor in path.ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() {
                state.dirs.insert(ancestor.to_path_buf());
            }
        }
        state.ensure_writable(path)?;
        state.files.insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<bool> {
        let mut state = self.state();
        state.ensure_writable(path)?;
        if state.files.contains_key(path) {
            return Ok(false);
        }
        state.files.insert(path.to_path_buf(), contents.to_vec());
        Ok(true)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.state().files.remove(path).map(|_| ()).ok_or_else(|| {
            io::Error::new(ErrorKind::NotFound, format!("{} not found", path.display()))
        })
    }

    fn open_log(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let mut state = self.state();
        state.ensure_writable(path)?;
        state.files.insert(path.to_path_buf(), Vec::new());
        Ok(Box::new(MemoryAppender {
            state: Arc::clone(&self.state),
            path: path.to_path_buf(),
        }))
    }

    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>> {
        let state = self.state();
        let names = state
            .dirs
            .iter()
            .filter(|dir| dir.parent() == Some(path))
            .filter_map(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        Ok(names)
    }

    fn local_path(&self, _path: &Path) -> Option<PathBuf> {
        None
    }
}

struct MemoryAppender {
    state: Arc<Mutex<MemoryState>>,
    path: PathBuf,
}

impl Write for MemoryAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
