#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jobflow::clock::SystemClock;
use jobflow::engine::{EngineOptions, Orchestrator, PoolSizes};
use jobflow::lock::{DistributedLock, KvLock, MemoryKvStore};
use jobflow::store::{InMemoryStore, Store};
use jobflow::task::model::{Task, TaskKind, TaskStatus};
use jobflow::types::{DependencyType, TaskId, TenantId, WorkflowId};
use jobflow::workflow::model::{Workflow, WorkflowStatus};

use crate::fake_executor::FakeExecutor;
use crate::faulty_store::FaultyStore;
use crate::recorders::{RecordingAudit, RecordingNotifier};

pub const TENANT: TenantId = TenantId(1);

/// A task of tenant 1 running the `noop` procedure.
pub fn task(id: u64, name: &str) -> Task {
    Task::new(
        TaskId(id),
        TENANT,
        name,
        TaskKind::Procedure {
            name: "noop".to_string(),
            args: Vec::new(),
        },
    )
}

pub fn shell_task(id: u64, name: &str, command: &str) -> Task {
    Task::new(
        TaskId(id),
        TENANT,
        name,
        TaskKind::Shell {
            command: command.to_string(),
        },
    )
}

pub fn workflow(id: u64, name: &str) -> Workflow {
    Workflow::new(WorkflowId(id), TENANT, name)
}

/// Engine options tuned for tests: short lock waits and a fast poll.
pub fn fast_options(instance: &str) -> EngineOptions {
    EngineOptions {
        instance_id: instance.to_string(),
        lock_ttl: Duration::from_secs(2),
        lock_wait: Duration::from_millis(200),
        lock_retry_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(20),
        pools: PoolSizes::default(),
    }
}

/// An orchestrator over an in-memory store and lock, a scripted executor,
/// and recording notifier and audit sink.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<InMemoryStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub executor: Arc<FakeExecutor>,
    pub notifier: Arc<RecordingNotifier>,
    pub audit: Arc<RecordingAudit>,
}

impl Harness {
    pub fn new() -> Self {
        let kv = Arc::new(MemoryKvStore::new(Arc::new(SystemClock)));
        let lock: Arc<dyn DistributedLock> = Arc::new(KvLock::new(kv, "test-node"));
        Self::with_lock(lock, "test-node")
    }

    /// Share a lock backend with other harnesses to model several instances.
    pub fn with_lock(lock: Arc<dyn DistributedLock>, instance: &str) -> Self {
        Self::with_options(lock, fast_options(instance))
    }

    pub fn with_options(lock: Arc<dyn DistributedLock>, options: EngineOptions) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::assemble(store.clone(), store, lock, options)
    }

    /// A harness whose orchestrator writes through a [`FaultyStore`].
    pub fn with_faults() -> (Self, Arc<FaultyStore>) {
        let store = Arc::new(InMemoryStore::new());
        let faulty = Arc::new(FaultyStore::new(store.clone()));
        let kv = Arc::new(MemoryKvStore::new(Arc::new(SystemClock)));
        let lock: Arc<dyn DistributedLock> = Arc::new(KvLock::new(kv, "test-node"));
        let harness = Self::assemble(store, faulty.clone(), lock, fast_options("test-node"));
        (harness, faulty)
    }

    fn assemble(
        store: Arc<InMemoryStore>,
        backing: Arc<dyn Store>,
        lock: Arc<dyn DistributedLock>,
        options: EngineOptions,
    ) -> Self {
        let executor = Arc::new(FakeExecutor::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let audit = Arc::new(RecordingAudit::default());

        let orchestrator = Orchestrator::builder(backing, lock.clone(), executor.clone())
            .notifier(notifier.clone())
            .audit(audit.clone())
            .options(options)
            .build();

        Self {
            orchestrator,
            store,
            lock,
            executor,
            notifier,
            audit,
        }
    }

    /// Register `workflow`, its `tasks` and `(source, target)` success edges.
    pub async fn install(&self, workflow: Workflow, tasks: Vec<Task>, edges: &[(u64, u64)]) {
        let id = workflow.id;
        self.orchestrator.schedule_workflow(workflow).await.unwrap();
        for mut t in tasks {
            t.workflow_id = Some(id);
            self.orchestrator.schedule_task(t).await.unwrap();
        }
        for &(source, target) in edges {
            self.orchestrator
                .add_dependency(id, TaskId(source), TaskId(target), DependencyType::SuccessRequired)
                .await
                .unwrap();
        }
    }

    pub async fn task_status(&self, id: u64) -> TaskStatus {
        self.store.load_task(TaskId(id)).await.unwrap().status
    }

    pub async fn workflow_status(&self, id: u64) -> WorkflowStatus {
        self.store.load_workflow(WorkflowId(id)).await.unwrap().status
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
