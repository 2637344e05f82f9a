use crate::types::Task;
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where tasks come from and where their changes go.
///
/// `persist` is an idempotent, at-least-once sink: it may see the same task
/// many times and must keep fields it does not understand.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_tasks(&self) -> ConductorResult<Vec<Task>>;
    async fn persist(&self, task: &Task) -> ConductorResult<()>;
}

/// In-memory store, used by tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: parking_lot::Mutex<(Vec<String>, HashMap<String, Task>)>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let store = Self::new();
        {
            let mut guard = store.tasks.lock();
            for task in tasks {
                guard.0.push(task.id.clone());
                guard.1.insert(task.id.clone(), task);
            }
        }
        store
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.tasks.lock().1.get(id).cloned()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_tasks(&self) -> ConductorResult<Vec<Task>> {
        let guard = self.tasks.lock();
        Ok(guard.0.iter().filter_map(|id| guard.1.get(id).cloned()).collect())
    }

    async fn persist(&self, task: &Task) -> ConductorResult<()> {
        let mut guard = self.tasks.lock();
        if !guard.1.contains_key(&task.id) {
            guard.0.push(task.id.clone());
        }
        guard.1.insert(task.id.clone(), task.clone());
        Ok(())
    }
}

/// A JSON document `{ "project": ..., "tasks": [...] }` on disk.
///
/// Writes merge each task into its existing entry key by key, so keys written
/// by other tools survive, and replace the file atomically via a temp file.
pub struct JsonFileTaskStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `project` field of the document, if any.
    pub async fn project(&self) -> ConductorResult<Option<String>> {
        let doc = self.read_document().await?;
        Ok(doc.get("project").and_then(Value::as_str).map(str::to_string))
    }

    async fn read_document(&self) -> ConductorResult<Map<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            let mut doc = Map::new();
            doc.insert("tasks".into(), Value::Array(Vec::new()));
            return Ok(doc);
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        match serde_json::from_str::<Value>(&raw)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(ConductorError::Store(format!(
                "{} is not a JSON object",
                self.path.display()
            ))),
        }
    }

    async fn write_document(&self, doc: &Map<String, Value>) -> ConductorResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn tasks_array(doc: &mut Map<String, Value>) -> ConductorResult<&mut Vec<Value>> {
    match doc
        .entry("tasks")
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(tasks) => Ok(tasks),
        _ => Err(ConductorError::Store("\"tasks\" is not an array".into())),
    }
}

#[async_trait]
impl TaskStore for JsonFileTaskStore {
    async fn load_tasks(&self) -> ConductorResult<Vec<Task>> {
        let mut doc = self.read_document().await?;
        let raw_tasks = std::mem::take(tasks_array(&mut doc)?);
        raw_tasks
            .into_iter()
            .map(|raw| {
                serde_json::from_value::<Task>(raw)
                    .map_err(|e| ConductorError::Store(format!("Failed to parse task: {e}")))
            })
            .collect()
    }

    async fn persist(&self, task: &Task) -> ConductorResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        let Value::Object(fields) = serde_json::to_value(task)? else {
            return Err(ConductorError::Store(format!(
                "task {} did not serialize to an object",
                task.id
            )));
        };

        let tasks = tasks_array(&mut doc)?;
        let existing = tasks
            .iter_mut()
            .find(|t| t.get("id").and_then(Value::as_str) == Some(task.id.as_str()));
        match existing {
            Some(Value::Object(entry)) => {
                for (key, value) in fields {
                    entry.insert(key, value);
                }
            }
            Some(other) => *other = Value::Object(fields),
            None => tasks.push(Value::Object(fields)),
        }
        self.write_document(&doc).await
    }
}
