//! Task orchestrator: routes tasks to registered instances by capability.
//!
//! Instances advertise capabilities in their registry metadata. A task of
//! type `T` goes to an idle, healthy instance whose capabilities contain `T`,
//! preferring the instance with the fewest completed tasks. With no such
//! instance the task waits in a FIFO pending queue until an instance frees up
//! or `dispatch_pending` is called.
//!
//! Task lifecycle (no skipped states, no automatic retry):
//!
//! ```text
//! PENDING ──► ASSIGNED ──► COMPLETED
//!                    └───► FAILED
//! ```

use crate::persistence::{JsonFileHook, OrchestratorSnapshot, PersistenceHook};
use intercom_core::{
    Error, InstanceKey, InstanceStatus, OrchestratorConfig, Result, ServiceInstance, Task,
    TaskStatus,
};
use intercom_registry::ServiceRegistry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Default)]
struct State {
    active: HashMap<String, Task>,
    pending: VecDeque<String>,
    history: VecDeque<Task>,
}

impl State {
    fn knows(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id) || self.history.iter().any(|t| t.task_id == task_id)
    }
}

pub struct TaskOrchestrator {
    registry: Arc<ServiceRegistry>,
    state: Mutex<State>,
    hook: Option<Arc<dyn PersistenceHook>>,
    history_limit: usize,
}

impl TaskOrchestrator {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(State::default()),
            hook: None,
            history_limit: OrchestratorConfig::default().history_limit,
        }
    }

    /// Build from config. With a snapshot path, the last snapshot (if any) is
    /// restored and every later change is written back to it.
    pub fn from_config(registry: Arc<ServiceRegistry>, config: &OrchestratorConfig) -> Result<Self> {
        let mut orchestrator = Self::new(registry).with_history_limit(config.history_limit);
        if let Some(path) = &config.snapshot_path {
            let hook = JsonFileHook::new(path);
            if let Some(snapshot) = hook.load()? {
                info!(
                    "Restoring {} active task(s) from {}",
                    snapshot.active.len(),
                    path.display()
                );
                orchestrator.restore(snapshot);
            }
            orchestrator = orchestrator.with_persistence(Arc::new(hook));
        }
        Ok(orchestrator)
    }

    pub fn with_persistence(mut self, hook: Arc<dyn PersistenceHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign a new task. Returns the chosen instance id, or `None` if the
    /// task was queued because no instance qualifies.
    pub fn assign_task(
        &self,
        task_id: &str,
        task_type: &str,
        payload: serde_json::Value,
        preferred_instance: Option<&str>,
    ) -> Result<Option<String>> {
        if task_id.is_empty() || task_type.is_empty() {
            return Err(Error::invalid_request("task id and type must be non-empty"));
        }

        let mut state = self.lock();
        if state.knows(task_id) {
            return Err(Error::DuplicateTask(task_id.to_string()));
        }

        let mut task = Task::new(task_id, task_type, payload, self.registry.clock().now());
        let chosen = self.claim_instance(task_type, preferred_instance);
        match &chosen {
            Some(key) => {
                self.mark_assigned(&mut task, key.clone());
                info!("Task {} ({}) assigned to {}", task_id, task_type, key);
            }
            None => {
                state.pending.push_back(task_id.to_string());
                info!(
                    "Task {} ({}) queued: no idle instance with that capability",
                    task_id, task_type
                );
            }
        }
        state.active.insert(task_id.to_string(), task);
        self.persist(&state);

        Ok(chosen.map(|key| key.instance_id))
    }

    /// Mark an assigned task completed and free its instance. Returns false
    /// when `instance_id` does not hold `task_id`.
    pub fn complete_task(
        &self,
        instance_id: &str,
        task_id: &str,
        result: serde_json::Value,
    ) -> Result<bool> {
        self.finish(instance_id, task_id, TaskStatus::Completed, |task| {
            task.result = Some(result);
        })
    }

    /// Mark an assigned task failed and free its instance. Failed tasks are
    /// not retried.
    pub fn fail_task(&self, instance_id: &str, task_id: &str, error: &str) -> Result<bool> {
        self.finish(instance_id, task_id, TaskStatus::Failed, |task| {
            task.error = Some(error.to_string());
        })
    }

    fn finish(
        &self,
        instance_id: &str,
        task_id: &str,
        outcome: TaskStatus,
        record: impl FnOnce(&mut Task),
    ) -> Result<bool> {
        let mut state = self.lock();
        let Some(task) = state.active.get(task_id) else {
            if state.history.iter().any(|t| t.task_id == task_id) {
                debug!("Task {} already finished", task_id);
                return Ok(false);
            }
            return Err(Error::TaskNotFound(task_id.to_string()));
        };

        let Some(key) = task
            .assigned_instance
            .clone()
            .filter(|key| key.instance_id == instance_id)
        else {
            warn!(
                "Task {} is not held by {} (status {}, held by {:?})",
                task_id,
                instance_id,
                task.status,
                task.assigned_instance.as_ref().map(|k| k.to_string())
            );
            return Ok(false);
        };
        if !task.status.can_transition_to(outcome) {
            return Ok(false);
        }

        let Some(mut task) = state.active.remove(task_id) else {
            return Ok(false);
        };
        record(&mut task);
        task.status = outcome;
        task.updated_at = self.registry.clock().now();

        let freed = match outcome {
            TaskStatus::Completed => self.registry.record_completion(&key),
            _ => self.registry.set_status(&key, InstanceStatus::Idle),
        };
        if let Err(e) = freed {
            warn!("Could not free {} after task {}: {}", key, task_id, e);
        }
        info!("Task {} {} on {}", task_id, outcome, key);

        state.history.push_back(task);
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }

        self.dispatch_locked(&mut state);
        self.persist(&state);
        Ok(true)
    }

    /// Retry queued tasks in FIFO order. Returns `(task_id, instance_id)` for
    /// each task that found an instance.
    pub fn dispatch_pending(&self) -> Vec<(String, String)> {
        let mut state = self.lock();
        let assigned = self.dispatch_locked(&mut state);
        if !assigned.is_empty() {
            self.persist(&state);
        }
        assigned
    }

    fn dispatch_locked(&self, state: &mut State) -> Vec<(String, String)> {
        let mut assigned = Vec::new();
        let mut still_pending = VecDeque::new();
        while let Some(task_id) = state.pending.pop_front() {
            let Some(task) = state.active.get_mut(&task_id) else {
                continue;
            };
            match self.claim_instance(&task.task_type, None) {
                Some(key) => {
                    self.mark_assigned(task, key.clone());
                    info!("Pending task {} assigned to {}", task_id, key);
                    assigned.push((task_id, key.instance_id));
                }
                None => still_pending.push_back(task_id),
            }
        }
        state.pending = still_pending;
        assigned
    }

    fn mark_assigned(&self, task: &mut Task, key: InstanceKey) {
        task.status = TaskStatus::Assigned;
        task.assigned_instance = Some(key);
        task.updated_at = self.registry.clock().now();
    }

    /// Pick and claim an instance. A named preferred instance wins if it is
    /// registered, healthy and idle; otherwise the least-loaded capable one.
    fn claim_instance(&self, task_type: &str, preferred: Option<&str>) -> Option<InstanceKey> {
        let candidates = self.registry.all(true);

        if let Some(preferred) = preferred {
            let mut named: Vec<&ServiceInstance> = candidates
                .iter()
                .filter(|i| i.instance_id == preferred && i.is_idle())
                .collect();
            // Same id under several services: capable ones first.
            named.sort_by_key(|i| !i.has_capability(task_type));
            if let Some(key) = self.claim_first(named) {
                return Some(key);
            }
            debug!(
                "Preferred instance {} unavailable for {}, matching by capability",
                preferred, task_type
            );
        }

        let mut capable: Vec<&ServiceInstance> = candidates
            .iter()
            .filter(|i| i.is_idle() && i.has_capability(task_type))
            .collect();
        capable.sort_by(|a, b| {
            a.completed_tasks
                .cmp(&b.completed_tasks)
                .then_with(|| a.service_name.cmp(&b.service_name))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        self.claim_first(capable)
    }

    fn claim_first(&self, candidates: Vec<&ServiceInstance>) -> Option<InstanceKey> {
        candidates.into_iter().map(|i| i.key()).find(|key| {
            // An instance that vanished since the snapshot simply loses its turn.
            self.registry.try_claim(key).unwrap_or(false)
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Look a task up in the active table, then in history.
    pub fn task(&self, task_id: &str) -> Option<Task> {
        let state = self.lock();
        state
            .active
            .get(task_id)
            .or_else(|| state.history.iter().find(|t| t.task_id == task_id))
            .cloned()
    }

    /// Pending and assigned tasks, ordered by task id.
    pub fn active(&self) -> Vec<Task> {
        sorted_tasks(&self.lock().active)
    }

    /// Ids of queued tasks in dispatch order.
    pub fn pending(&self) -> Vec<String> {
        self.lock().pending.iter().cloned().collect()
    }

    /// Finished tasks, oldest first.
    pub fn history(&self) -> Vec<Task> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        self.snapshot_of(&self.lock())
    }

    fn snapshot_of(&self, state: &State) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            taken_at: self.registry.clock().now(),
            active: sorted_tasks(&state.active),
            pending: state.pending.iter().cloned().collect(),
            history: state.history.iter().cloned().collect(),
        }
    }

    /// Replace all task state with `snapshot`. Instances still registered that
    /// hold an assigned task are marked busy again.
    pub fn restore(&self, snapshot: OrchestratorSnapshot) {
        let mut state = self.lock();
        state.active = snapshot
            .active
            .into_iter()
            .map(|t| (t.task_id.clone(), t))
            .collect();
        state.pending = snapshot.pending.into_iter().collect();
        state.history = snapshot.history.into_iter().collect();

        for task in state.active.values() {
            if let (TaskStatus::Assigned, Some(key)) = (task.status, &task.assigned_instance) {
                if let Err(e) = self.registry.set_status(key, InstanceStatus::Busy) {
                    debug!("Restored task {} holds unknown instance: {}", task.task_id, e);
                }
            }
        }
    }

    fn persist(&self, state: &State) {
        if let Some(hook) = &self.hook {
            if let Err(e) = hook.persist(&self.snapshot_of(state)) {
                warn!("Failed to persist task snapshot: {}", e);
            }
        }
    }
}

fn sorted_tasks(tasks: &HashMap<String, Task>) -> Vec<Task> {
    let mut out: Vec<Task> = tasks.values().cloned().collect();
    out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    out
}
