//! Instance store: one isolated directory per `(unit, instance)` pair.
//!
//! All writes are create-if-absent or atomic renames, so several orchestrator
//! processes can share a run root. A `.flowrun.lock` file marks an instance
//! whose unit is currently running.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::config::{Config, PROJECT_ROOT_KEY};
use crate::core::path::{ArtifactPaths, LOCK_FILE, instance_dir};
use crate::core::types::ExecutionResult;
use crate::error::{FlowError, FlowResult};
use crate::io::process::process_alive;
use crate::io::storage::Storage;

#[derive(Clone)]
pub struct InstanceStore {
    storage: Arc<dyn Storage>,
    base: PathBuf,
}

impl InstanceStore {
    pub fn new(storage: Arc<dyn Storage>, base: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            base: base.into(),
        }
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Store for the flows of a build instance (`{build_dir}/runs`).
    pub fn nested(&self, build_dir: &Path) -> InstanceStore {
        InstanceStore::new(Arc::clone(&self.storage), build_dir.join("runs"))
    }

    /// Directory of the pair, without touching storage.
    pub fn dir_of(&self, unit: &str, instance: &str) -> FlowResult<PathBuf> {
        instance_dir(&self.base, unit, instance)
    }

    /// Create the instance directory if absent and return it.
    ///
    /// Safe to call repeatedly and from several processes at once.
    #[instrument(skip_all, fields(unit = %unit, instance = %instance))]
    pub fn allocate(&self, unit: &str, instance: &str) -> FlowResult<PathBuf> {
        let dir = self.dir_of(unit, instance)?;
        let created = self
            .storage
            .create_dir(&dir)
            .map_err(|err| FlowError::storage("create directory", &dir, err))?;
        debug!(dir = %dir.display(), created, "instance allocated");
        Ok(dir)
    }

    /// Write `config` verbatim to `{unit}_config.json`.
    pub fn snapshot(&self, paths: &ArtifactPaths, config: &Config) -> FlowResult<()> {
        self.write_json(&paths.config, config)
    }

    /// Pretty JSON with a trailing newline, written atomically.
    ///
    /// A value that cannot be serialized is a config error.
    pub fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> FlowResult<()> {
        let mut buf = serde_json::to_string_pretty(value).map_err(|err| {
            FlowError::config(format!("serialize {}: {err}", path.display()))
        })?;
        buf.push('\n');
        self.storage
            .write_atomic(path, buf.as_bytes())
            .map_err(|err| FlowError::storage("write", path, err))
    }

    /// Parse a JSON artifact; `Ok(None)` when the file does not exist.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> FlowResult<Option<T>> {
        if !self.storage.is_file(path) {
            return Ok(None);
        }
        let bytes = self
            .storage
            .read(path)
            .map_err(|err| FlowError::storage("read", path, err))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| FlowError::config(format!("parse {}: {err}", path.display())))
    }

    /// Persisted configuration snapshot of an instance.
    pub fn load_snapshot(&self, paths: &ArtifactPaths) -> FlowResult<Config> {
        self.read_json(&paths.config)?.ok_or_else(|| {
            FlowError::config(format!(
                "no configuration snapshot at {}",
                paths.config.display()
            ))
        })
    }

    /// Persisted result, or `None` when absent or unreadable.
    pub fn load_result(&self, paths: &ArtifactPaths) -> Option<ExecutionResult> {
        match self.read_json(&paths.result) {
            Ok(result) => result,
            Err(err) => {
                warn!(path = %paths.result.display(), err = %err, "ignoring unreadable result");
                None
            }
        }
    }

    pub fn write_result(&self, paths: &ArtifactPaths, result: &ExecutionResult) -> FlowResult<()> {
        debug!(
            path = %paths.result.display(),
            status = %result.status,
            completed = result.completed,
            "writing result"
        );
        self.write_json(&paths.result, result)
    }

    /// Log text, or `None` when the unit never started logging.
    pub fn read_log(&self, path: &Path) -> FlowResult<Option<String>> {
        if !self.storage.is_file(path) {
            return Ok(None);
        }
        self.storage
            .read_to_string(path)
            .map(Some)
            .map_err(|err| FlowError::storage("read log", path, err))
    }

    /// Take the instance lock for one unit run.
    ///
    /// A lock left behind by a process that no longer exists is taken over.
    pub fn lock(&self, dir: &Path) -> FlowResult<InstanceLock> {
        let lock = dir.join(LOCK_FILE);
        let contents = format!("{}\n", std::process::id());
        let mut acquired = self.create_lock(&lock, &contents)?;
        if !acquired && let Some(pid) = self.stale_owner(&lock) {
            warn!(
                lock = %lock.display(),
                pid,
                "taking over lock of a process that no longer exists"
            );
            self.storage
                .remove_file(&lock)
                .map_err(|err| FlowError::storage("remove stale lock", &lock, err))?;
            acquired = self.create_lock(&lock, &contents)?;
        }
        if !acquired {
            return Err(FlowError::InstanceBusy {
                dir: dir.to_path_buf(),
                lock,
            });
        }
        Ok(InstanceLock {
            storage: Arc::clone(&self.storage),
            path: lock,
        })
    }

    fn create_lock(&self, lock: &Path, contents: &str) -> FlowResult<bool> {
        self.storage
            .create_new(lock, contents.as_bytes())
            .map_err(|err| FlowError::storage("create lock", lock, err))
    }

    /// PID recorded in `lock` when that process is gone.
    fn stale_owner(&self, lock: &Path) -> Option<u32> {
        let text = self.storage.read_to_string(lock).ok()?;
        let pid = text.trim().parse::<u32>().ok()?;
        (!process_alive(pid)).then_some(pid)
    }

    /// Held by a live process. Stale locks do not count.
    pub fn is_locked(&self, dir: &Path) -> bool {
        let lock = dir.join(LOCK_FILE);
        self.storage.is_file(&lock) && self.stale_owner(&lock).is_none()
    }

    /// Where `path` lives for a child process: the real location when the
    /// backend has one, else the logical path.
    pub fn location(&self, path: &Path) -> PathBuf {
        self.storage
            .local_path(path)
            .unwrap_or_else(|| path.to_path_buf())
    }
}

/// Copy of `config` carrying the reserved `_project_root` as an absolute path.
pub fn inject_project_root(config: &Config, root: &Path) -> Config {
    let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let mut config = config.clone();
    config.insert(
        PROJECT_ROOT_KEY.to_string(),
        Value::String(root.to_string_lossy().into_owned()),
    );
    config
}

/// Held while a unit runs; removes the lock file when dropped.
pub struct InstanceLock {
    storage: Arc<dyn Storage>,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = self.storage.remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Status, UnitKind};
    use crate::io::storage::{FsStorage, MemoryStorage};
    use serde_json::json;

    fn memory_store() -> InstanceStore {
        InstanceStore::new(Arc::new(MemoryStorage::new()), "runs")
    }

    fn result(paths: &ArtifactPaths) -> ExecutionResult {
        ExecutionResult {
            unit: "prep".to_string(),
            kind: UnitKind::Flow,
            instance: "A".to_string(),
            status: Status::Success,
            completed: true,
            log_path: paths.log.clone(),
            artifact_path: paths.executed.clone(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            ended_at: Some("2026-01-01T00:00:01Z".to_string()),
            duration_ms: Some(1000),
            config_digest: "abc".to_string(),
            exit_code: Some(0),
            error: None,
        }
    }

    #[test]
    fn allocate_is_idempotent() {
        let store = memory_store();
        let first = store.allocate("prep", "A").expect("allocate");
        let second = store.allocate("prep", "A").expect("allocate again");
        assert_eq!(first, second);
        assert_eq!(first, PathBuf::from("runs/prep/A"));
        assert!(store.storage().is_dir(&first));
    }

    #[test]
    fn allocate_rejects_unsafe_names() {
        let store = memory_store();
        let err = store.allocate("prep", "../A").unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    /// Verifies the snapshot is the verbatim configuration as pretty JSON.
    #[test]
    fn snapshot_writes_pretty_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = InstanceStore::new(Arc::new(FsStorage::new(temp.path())), "runs");
        let dir = store.allocate("prep", "A").expect("allocate");
        let paths = ArtifactPaths::new(&dir, "prep");
        let config = json!({"threshold": 0.5, "database": {"host": "db"}})
            .as_object()
            .cloned()
            .expect("object");
        store.snapshot(&paths, &config).expect("snapshot");

        let snapshot = temp.path().join("runs/prep/A/prep_config.json");
        let written = std::fs::read_to_string(snapshot).expect("read");
        assert_eq!(
            written,
            "{\n  \"threshold\": 0.5,\n  \"database\": {\n    \"host\": \"db\"\n  }\n}\n"
        );
        assert_eq!(store.load_snapshot(&paths).expect("load"), config);
    }

    #[test]
    fn snapshot_into_missing_directory_is_storage_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("runs");
        std::fs::write(&blocker, "not a dir").expect("blocker");
        let store = InstanceStore::new(Arc::new(FsStorage::new(temp.path())), "runs");
        let paths = ArtifactPaths::new(Path::new("runs/prep/A"), "prep");
        let err = store.snapshot(&paths, &Config::new()).unwrap_err();
        assert_eq!(err.kind(), "StorageError");
    }

    #[test]
    fn second_lock_holder_is_refused_until_release() {
        let store = memory_store();
        let dir = store.allocate("prep", "A").expect("allocate");
        let lock = store.lock(&dir).expect("lock");
        assert!(store.is_locked(&dir));
        match store.lock(&dir) {
            Err(FlowError::InstanceBusy { .. }) => {}
            other => panic!("expected InstanceBusy, got {:?}", other.map(|_| ())),
        }
        drop(lock);
        assert!(!store.is_locked(&dir));
        store.lock(&dir).expect("relock");
    }

    /// Verifies a lock left by a killed run is taken over, while a lock
    /// held by a live process still refuses.
    #[test]
    fn stale_lock_of_dead_process_is_taken_over() {
        let store = memory_store();
        let dir = store.allocate("prep", "A").expect("allocate");
        let lock_path = dir.join(LOCK_FILE);
        let dead = format!("{}\n", crate::test_support::dead_pid());
        store
            .storage()
            .write_atomic(&lock_path, dead.as_bytes())
            .expect("stale lock");
        assert!(!store.is_locked(&dir));

        let lock = store.lock(&dir).expect("take over");
        let owner = store.storage().read_to_string(&lock_path).expect("read lock");
        assert_eq!(owner.trim(), std::process::id().to_string());
        assert!(store.is_locked(&dir));
        assert!(matches!(store.lock(&dir), Err(FlowError::InstanceBusy { .. })));
        drop(lock);
        assert!(!store.storage().is_file(&lock_path));
    }

    #[test]
    fn results_load_back_and_tolerate_garbage() {
        let store = memory_store();
        let dir = store.allocate("prep", "A").expect("allocate");
        let paths = ArtifactPaths::new(&dir, "prep");
        assert!(store.load_result(&paths).is_none());

        store.write_result(&paths, &result(&paths)).expect("write");
        assert_eq!(store.load_result(&paths), Some(result(&paths)));

        store
            .storage()
            .write_atomic(&paths.result, b"{ not json")
            .expect("corrupt");
        assert!(store.load_result(&paths).is_none());
    }

    #[test]
    fn project_root_is_injected_as_absolute_path() {
        let config = inject_project_root(&Config::new(), Path::new("relative/root"));
        let root = config[PROJECT_ROOT_KEY].as_str().expect("string");
        assert!(Path::new(root).is_absolute());
        assert!(root.ends_with("relative/root"));
    }

    #[test]
    fn nested_store_roots_under_build_dir() {
        let store = memory_store();
        let nested = store.nested(Path::new("runs/model/A"));
        assert_eq!(
            nested.dir_of("prep", "A").expect("dir"),
            PathBuf::from("runs/model/A/runs/prep/A")
        );
    }
}
