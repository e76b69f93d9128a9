//! Local task content consumed by the sync engine.
//!
//! The engine never owns task content; it reads and writes through a
//! [`TaskStore`]. [`FileTaskStore`] keeps one YAML file per task under
//! `.zen/tasks/`, [`MemoryTaskStore`] backs tests and dry runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{Result, ZenError};
use crate::io;
use crate::paths;
use crate::types::InternalTaskData;

pub trait TaskStore: Send + Sync {
    /// `not_found` when the task has no local content.
    fn get(&self, task_id: &str) -> Result<InternalTaskData>;

    fn put(&self, task_id: &str, task: &InternalTaskData) -> Result<()>;

    fn updated_at(&self, task_id: &str) -> Result<DateTime<Utc>>;

    fn list(&self) -> Result<Vec<String>>;
}

fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty()
        || task_id == "."
        || task_id.contains("..")
        || task_id.contains(['/', '\\'])
    {
        return Err(ZenError::invalid_data(format!("invalid task id '{task_id}'")).with_task(task_id));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// FileTaskStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    /// Store rooted at `<root>/.zen/tasks`.
    pub fn new(root: &Path) -> Self {
        Self {
            dir: paths::tasks_dir(root),
        }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, task_id: &str) -> Result<PathBuf> {
        validate_task_id(task_id)?;
        Ok(self.dir.join(format!("{task_id}.yaml")))
    }
}

impl TaskStore for FileTaskStore {
    fn get(&self, task_id: &str) -> Result<InternalTaskData> {
        let path = self.path_for(task_id)?;
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ZenError::not_found(format!("task '{task_id}'")).with_task(task_id));
            }
            Err(e) => return Err(ZenError::from(e).with_task(task_id)),
        };
        let task: InternalTaskData = serde_yaml::from_str(&data).map_err(|e| {
            ZenError::invalid_data(format!("task file {}", path.display()))
                .with_task(task_id)
                .with_source(e)
        })?;
        Ok(task)
    }

    fn put(&self, task_id: &str, task: &InternalTaskData) -> Result<()> {
        let path = self.path_for(task_id)?;
        let data = serde_yaml::to_string(task)?;
        io::atomic_write(&path, data.as_bytes())
    }

    fn updated_at(&self, task_id: &str) -> Result<DateTime<Utc>> {
        Ok(self.get(task_id)?.updated)
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// MemoryTaskStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<String, InternalTaskData>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = InternalTaskData>) -> Self {
        let map = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            tasks: Mutex::new(map),
        }
    }
}

impl TaskStore for MemoryTaskStore {
    fn get(&self, task_id: &str) -> Result<InternalTaskData> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .cloned()
            .ok_or_else(|| ZenError::not_found(format!("task '{task_id}'")).with_task(task_id))
    }

    fn put(&self, task_id: &str, task: &InternalTaskData) -> Result<()> {
        validate_task_id(task_id)?;
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), task.clone());
        Ok(())
    }

    fn updated_at(&self, task_id: &str) -> Result<DateTime<Utc>> {
        Ok(self.get(task_id)?.updated)
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tempfile::TempDir;

    #[test]
    fn file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(dir.path());
        let mut task = InternalTaskData::new("T1", "Write docs");
        task.status = "in_progress".into();
        store.put("T1", &task).unwrap();

        let loaded = store.get("T1").unwrap();
        assert_eq!(loaded, task);
        assert_eq!(store.updated_at("T1").unwrap(), task.updated);
        assert!(dir.path().join(".zen/tasks/T1.yaml").exists());
        assert_eq!(store.list().unwrap(), vec!["T1".to_string()]);
    }

    #[test]
    fn file_store_missing_task_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(dir.path());
        assert!(store.get("nope").unwrap_err().is(ErrorCode::NotFound));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn file_store_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(dir.path());
        let task = InternalTaskData::new("x", "x");
        for bad in ["", "../etc", "a/b", "a\\b"] {
            assert!(store.put(bad, &task).unwrap_err().is(ErrorCode::InvalidData), "{bad}");
        }
    }

    #[test]
    fn file_store_corrupt_yaml_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::new(dir.path());
        std::fs::create_dir_all(paths::tasks_dir(dir.path())).unwrap();
        std::fs::write(paths::tasks_dir(dir.path()).join("T1.yaml"), "title: [").unwrap();
        assert!(store.get("T1").unwrap_err().is(ErrorCode::InvalidData));
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryTaskStore::with_tasks([InternalTaskData::new("A", "a")]);
        assert_eq!(store.get("A").unwrap().title, "a");
        store.put("B", &InternalTaskData::new("B", "b")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["A".to_string(), "B".to_string()]);
        assert!(store.get("C").unwrap_err().is(ErrorCode::NotFound));
    }
}
