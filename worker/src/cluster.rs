//! Static cluster membership: which address and GPUs belong to every task.

use std::{collections::HashMap, env, fmt, fs, path::Path};

use serde::Deserialize;

use crate::{Result, WorkerErr};

/// The environment variable holding this process' task index.
pub const TASK_ENV: &str = "TASK";

/// The name of the only job of the cluster.
pub const WORKER_JOB: &str = "worker";

/// The index of a process within the worker job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskIndex(usize);

impl TaskIndex {
    pub const LEADER: TaskIndex = TaskIndex(0);

    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn get(self) -> usize {
        self.0
    }

    /// Reads the task index from the `TASK` environment variable.
    ///
    /// # Returns
    /// The task index or a `ConfigurationError` if the variable is absent or not a
    /// non-negative integer.
    pub fn from_env() -> Result<Self> {
        let raw = env::var(TASK_ENV)
            .map_err(|e| WorkerErr::config(format!("reading ${TASK_ENV}: {e}")))?;

        Self::parse(&raw)
    }

    /// Parses a task index.
    pub fn parse(raw: &str) -> Result<Self> {
        raw.trim()
            .parse()
            .map(Self)
            .map_err(|e| WorkerErr::config(format!("invalid task index {raw:?}: {e}")))
    }
}

impl fmt::Display for TaskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The part a process plays in the cluster, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initializes or restores the variables and writes checkpoints.
    Leader,
    /// Waits for the leader and trains.
    Follower,
}

impl Role {
    /// The role of `task`, only the first task leads.
    pub fn of(task: TaskIndex) -> Self {
        if task == TaskIndex::LEADER {
            Self::Leader
        } else {
            Self::Follower
        }
    }

    pub fn is_leader(self) -> bool {
        self == Self::Leader
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// The on-disk shape of the cluster document.
#[derive(Debug, Deserialize)]
struct ClusterDocument {
    addresses: HashMap<String, Vec<String>>,
    #[serde(default)]
    gpus: Vec<Vec<u32>>,
}

/// Everything this process knows about a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    pub task: TaskIndex,
    pub address: String,
    pub gpus: Vec<u32>,
}

impl TaskEntry {
    pub fn has_gpus(&self) -> bool {
        !self.gpus.is_empty()
    }

    /// Renders the GPU list the way `CUDA_VISIBLE_DEVICES` expects it.
    ///
    /// # Returns
    /// A comma separated list of device ids, empty for CPU only tasks.
    pub fn visible_devices(&self) -> String {
        self.gpus
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// The immutable mapping from task index to address and GPUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    addresses: Vec<String>,
    gpus: Vec<Vec<u32>>,
}

impl ClusterDescriptor {
    /// Creates a new `ClusterDescriptor`.
    ///
    /// # Arguments
    /// * `addresses` - The address of every task, in task order.
    /// * `gpus` - The GPU ids of every task, tasks past its end get no GPUs.
    ///
    /// # Returns
    /// The descriptor or a `ConfigurationError` if there are no tasks or an address is empty.
    pub fn new(addresses: Vec<String>, gpus: Vec<Vec<u32>>) -> Result<Self> {
        if addresses.is_empty() {
            return Err(WorkerErr::config("the cluster has no worker tasks"));
        }

        if let Some(task) = addresses.iter().position(|addr| addr.trim().is_empty()) {
            return Err(WorkerErr::config(format!("task {task} has an empty address")));
        }

        if gpus.len() > addresses.len() {
            return Err(WorkerErr::config(format!(
                "{} gpu lists given for {} tasks",
                gpus.len(),
                addresses.len()
            )));
        }

        Ok(Self { addresses, gpus })
    }

    /// Parses a cluster document.
    ///
    /// # Arguments
    /// * `json` - A document like `{"addresses": {"worker": [...]}, "gpus": [[...], ...]}`.
    ///
    /// # Returns
    /// The descriptor or a `ConfigurationError` if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut doc: ClusterDocument = serde_json::from_str(json)
            .map_err(|e| WorkerErr::config(format!("malformed cluster document: {e}")))?;

        let addresses = doc
            .addresses
            .remove(WORKER_JOB)
            .ok_or_else(|| WorkerErr::config(format!("the cluster has no {WORKER_JOB:?} job")))?;

        Self::new(addresses, doc.gpus)
    }

    /// Reads and parses the cluster document at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            WorkerErr::config(format!("reading cluster document {}: {e}", path.display()))
        })?;

        Self::from_json(&json)
    }

    /// The amount of tasks in the cluster.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Resolves the entry of `task`.
    ///
    /// # Returns
    /// The task's entry or a `ConfigurationError` if the cluster has no such task.
    pub fn entry(&self, task: TaskIndex) -> Result<TaskEntry> {
        let address = self.addresses.get(task.get()).ok_or_else(|| {
            WorkerErr::config(format!(
                "task {task} is not part of a cluster of {} tasks",
                self.len()
            ))
        })?;

        Ok(TaskEntry {
            task,
            address: address.clone(),
            gpus: self.gpus.get(task.get()).cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "addresses": {"worker": ["10.0.0.1:2222", "10.0.0.2:2222", "10.0.0.3:2222"]},
        "gpus": [[0], [1, 2]]
    }"#;

    #[test]
    fn entries_are_deterministic() {
        let cluster = ClusterDescriptor::from_json(DOC).unwrap();
        let task = TaskIndex::new(1);

        let entry = cluster.entry(task).unwrap();
        assert_eq!(entry, cluster.entry(task).unwrap());
        assert_eq!(entry.address, "10.0.0.2:2222");
        assert_eq!(entry.gpus, [1, 2]);
        assert_eq!(entry.visible_devices(), "1,2");
    }

    #[test]
    fn tasks_past_the_gpu_list_run_on_cpu() {
        let cluster = ClusterDescriptor::from_json(DOC).unwrap();
        let entry = cluster.entry(TaskIndex::new(2)).unwrap();

        assert!(!entry.has_gpus());
        assert_eq!(entry.visible_devices(), "");
    }

    #[test]
    fn absent_tasks_are_a_configuration_error() {
        let cluster = ClusterDescriptor::from_json(DOC).unwrap();

        assert!(matches!(
            cluster.entry(TaskIndex::new(3)),
            Err(WorkerErr::Configuration(_))
        ));
    }

    #[test]
    fn malformed_documents_are_rejected() {
        for doc in [
            "not json",
            r#"{"addresses": {"ps": ["a:1"]}}"#,
            r#"{"addresses": {"worker": []}}"#,
            r#"{"addresses": {"worker": ["a:1", " "]}}"#,
        ] {
            assert!(
                matches!(
                    ClusterDescriptor::from_json(doc),
                    Err(WorkerErr::Configuration(_))
                ),
                "{doc}"
            );
        }
    }

    #[test]
    fn task_index_parsing() {
        assert_eq!(TaskIndex::parse("3").unwrap(), TaskIndex::new(3));
        assert_eq!(TaskIndex::parse(" 0\n").unwrap(), TaskIndex::LEADER);

        for raw in ["", "-1", "one", "1.5"] {
            assert!(matches!(
                TaskIndex::parse(raw),
                Err(WorkerErr::Configuration(_))
            ));
        }
    }

    #[test]
    fn only_the_first_task_leads() {
        assert_eq!(Role::of(TaskIndex::new(0)), Role::Leader);
        assert_eq!(Role::of(TaskIndex::new(1)), Role::Follower);
        assert!(!Role::of(TaskIndex::new(7)).is_leader());
    }
}
