// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Team lead: one per project.
//!
//! Turns directives into kanban tasks, dispatches each ready task to a fresh
//! worker, and feeds successful workers' branches through the merge queue.
//! Messages are handled one at a time from an inbox, so the board and the
//! merge queue only ever see sequential updates.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, MessageHandler, MessageType};
use crate::error::AgentError;
use crate::git::DEFAULT_TRUNK;

use super::merge_queue::{MergeOutcome, MergeQueue, MergeRequest};
use super::types::{AgentRecord, AgentRole};
use super::worker::Worker;
use super::AgentServices;

/// A project managed by one team lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    pub project_id: String,
    pub repo_path: PathBuf,
    pub trunk_branch: String,
    /// Standing rules handed to every worker.
    #[serde(default)]
    pub rules: Option<String>,
    #[serde(default)]
    pub coding_agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ProjectSpec {
    pub fn new(project_id: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            project_id: project_id.into(),
            repo_path: repo_path.into(),
            trunk_branch: DEFAULT_TRUNK.to_string(),
            rules: None,
            coding_agent: None,
            model: None,
        }
    }

    pub fn with_trunk(mut self, trunk: impl Into<String>) -> Self {
        self.trunk_branch = trunk.into();
        self
    }

    pub fn with_rules(mut self, rules: impl Into<String>) -> Self {
        self.rules = Some(rules.into());
        self
    }

    pub fn with_coding_agent(mut self, agent_type: impl Into<String>) -> Self {
        self.coding_agent = Some(agent_type.into());
        self
    }
}

/// Kanban column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Dispatched,
    Merging,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Done | Self::Failed)
    }

    fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Merging)
    }
}

/// One task on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KanbanTask {
    pub id: String,
    /// Creation order; breaks ties between tasks that become ready together.
    pub seq: u64,
    pub description: String,
    pub blocked_by: Vec<String>,
    pub state: TaskState,
    pub worker_id: Option<String>,
    /// Directive the task came from; its report is correlated to it.
    pub origin_directive: Option<String>,
    pub conversation_id: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Default)]
struct Board {
    tasks: Vec<KanbanTask>,
    next_seq: u64,
    instructions: Option<String>,
}

impl Board {
    fn get(&self, id: &str) -> Option<&KanbanTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut KanbanTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn is_done(&self, id: &str) -> bool {
        self.get(id).map(|t| t.state == TaskState::Done).unwrap_or(false)
    }

    fn is_ready(&self, task: &KanbanTask) -> bool {
        task.state == TaskState::Pending && task.blocked_by.iter().all(|d| self.is_done(d))
    }

    fn ready(&self) -> Vec<KanbanTask> {
        let mut ready: Vec<KanbanTask> = self
            .tasks
            .iter()
            .filter(|t| self.is_ready(t))
            .cloned()
            .collect();
        ready.sort_by_key(|t| t.seq);
        ready
    }

    /// Pending tasks that transitively depend on `failed`.
    fn dependents_of(&self, failed: &str) -> Vec<String> {
        let mut doomed: HashSet<String> = HashSet::new();
        let mut frontier = vec![failed.to_string()];
        while let Some(id) = frontier.pop() {
            for task in &self.tasks {
                if task.state == TaskState::Pending
                    && task.blocked_by.contains(&id)
                    && doomed.insert(task.id.clone())
                {
                    frontier.push(task.id.clone());
                }
            }
        }
        let mut ids: Vec<String> = doomed.into_iter().collect();
        ids.sort_by_key(|id| self.get(id).map(|t| t.seq).unwrap_or(u64::MAX));
        ids
    }
}

/// Team lead agent.
pub struct TeamLead {
    id: String,
    project: ProjectSpec,
    services: Arc<AgentServices>,
    merges: MergeQueue,
    board: Mutex<Board>,
    workers: StdMutex<HashMap<String, Arc<Worker>>>,
}

impl TeamLead {
    /// Create a team lead without subscribing it to the bus.
    pub fn new(services: Arc<AgentServices>, record: &AgentRecord, project: ProjectSpec) -> Self {
        let merges = MergeQueue::new(
            services.git().clone(),
            project.repo_path.clone(),
            project.trunk_branch.clone(),
        )
        .with_rebase_siblings(services.settings.rebase_siblings);
        Self {
            id: record.id.clone(),
            project,
            services,
            merges,
            board: Mutex::new(Board::default()),
            workers: StdMutex::new(HashMap::new()),
        }
    }

    /// Create a team lead and start its inbox loop.
    ///
    /// Must be called inside a tokio runtime. The loop ends when the lead is
    /// unsubscribed from the bus.
    pub fn spawn(services: Arc<AgentServices>, record: &AgentRecord, project: ProjectSpec) -> Arc<Self> {
        let lead = Arc::new(Self::new(services, record, project));
        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
        let handler: MessageHandler = Arc::new(move |message: BusMessage| {
            let _ = tx.send(message);
        });
        lead.services.bus.subscribe(&lead.id, handler);

        let inbox = lead.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = inbox.handle_message(message).await {
                    warn!(team_lead = %inbox.id, "Message handling failed: {}", e);
                }
            }
            debug!(team_lead = %inbox.id, "Inbox closed");
        });
        lead
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project(&self) -> &ProjectSpec {
        &self.project
    }

    pub fn merge_queue(&self) -> &MergeQueue {
        &self.merges
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<String, Arc<Worker>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the board in creation order.
    pub async fn tasks(&self) -> Vec<KanbanTask> {
        self.board.lock().await.tasks.clone()
    }

    /// Instructions installed by the last recovery directive.
    pub async fn instructions(&self) -> Option<String> {
        self.board.lock().await.instructions.clone()
    }

    /// Pending tasks whose dependencies are all done, in creation order.
    pub async fn ready_tasks(&self) -> Vec<KanbanTask> {
        self.board.lock().await.ready()
    }

    /// Add a task. Every id in `blocked_by` must already be on the board.
    pub async fn add_task(
        &self,
        description: impl Into<String>,
        blocked_by: Vec<String>,
    ) -> Result<String, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.insert_task(id, description.into(), blocked_by, None, None, true)
            .await
    }

    async fn insert_task(
        &self,
        id: String,
        description: String,
        blocked_by: Vec<String>,
        origin_directive: Option<String>,
        conversation_id: Option<String>,
        strict: bool,
    ) -> Result<String, AgentError> {
        let mut board = self.board.lock().await;
        let blocked_by = if strict {
            if let Some(missing) = blocked_by.iter().find(|d| board.get(d).is_none()) {
                return Err(AgentError::TaskNotFound(missing.clone()));
            }
            blocked_by
        } else {
            // Dependencies that finished before a restart are gone.
            blocked_by
                .into_iter()
                .filter(|d| board.get(d).is_some())
                .collect()
        };

        let seq = board.next_seq;
        board.next_seq += 1;
        debug!(team_lead = %self.id, task_id = %id, seq, "Task added");
        board.tasks.push(KanbanTask {
            id: id.clone(),
            seq,
            description,
            blocked_by,
            state: TaskState::Pending,
            worker_id: None,
            origin_directive,
            conversation_id,
            summary: None,
        });
        Ok(id)
    }

    /// Hand a task to a new worker. Returns the worker id.
    ///
    /// Refused with [`AgentError::TaskBlocked`] while a dependency is unfinished
    /// and with [`AgentError::ProjectBusy`] while another coding worker of the
    /// project is busy.
    pub async fn dispatch(&self, task_id: &str) -> Result<String, AgentError> {
        let mut board = self.board.lock().await;
        let task = board
            .get(task_id)
            .ok_or_else(|| AgentError::TaskNotFound(task_id.to_string()))?;
        if !board.is_ready(task) {
            return Err(AgentError::TaskBlocked(task_id.to_string()));
        }

        let record = AgentRecord::new(AgentRole::Worker, Some(&self.id))
            .with_name(format!("{}-worker-{}", self.project.project_id, task.seq))
            .with_project(self.project.project_id.clone())
            .with_workspace(self.project.repo_path.clone())
            .with_model(self.project.model.clone())
            .with_coding_agent(
                self.project
                    .coding_agent
                    .clone()
                    .or_else(|| self.services.settings.default_coding_agent.clone()),
            );

        if record.is_coding_worker() {
            let in_flight = board
                .tasks
                .iter()
                .find(|t| t.state.is_in_flight())
                .and_then(|t| t.worker_id.clone());
            let busy = in_flight.or_else(|| {
                self.services
                    .registry
                    .busy_coding_worker(&self.project.project_id)
                    .map(|w| w.id)
            });
            if let Some(worker_id) = busy {
                return Err(AgentError::ProjectBusy {
                    project_id: self.project.project_id.clone(),
                    worker_id,
                });
            }
        }

        let content = compose_worker_directive(
            self.project.rules.as_deref(),
            board.instructions.as_deref(),
            &task.description,
        );
        let conversation_id = task.conversation_id.clone();

        let record = self.services.registry.create(record)?;
        let worker = Worker::spawn(self.services.clone(), &record);
        self.workers().insert(record.id.clone(), worker);

        if let Some(task) = board.get_mut(task_id) {
            task.state = TaskState::Dispatched;
            task.worker_id = Some(record.id.clone());
        }

        info!(team_lead = %self.id, task_id, worker_id = %record.id, "Task dispatched");
        self.services.bus.send(
            BusMessage::directive(Some(&self.id), &record.id, content)
                .with_conversation(conversation_id.as_deref())
                .with_metadata("taskId", json!(task_id)),
        )?;
        Ok(record.id)
    }

    /// Dispatch ready tasks in creation order until the project is busy.
    pub async fn schedule(&self) -> Vec<String> {
        let mut dispatched = Vec::new();
        for task in self.ready_tasks().await {
            match self.dispatch(&task.id).await {
                Ok(worker_id) => dispatched.push(worker_id),
                Err(AgentError::ProjectBusy { worker_id, .. }) => {
                    debug!(team_lead = %self.id, busy = %worker_id, "Project busy, holding tasks");
                    break;
                }
                Err(e) => warn!(team_lead = %self.id, task_id = %task.id, "Dispatch failed: {}", e),
            }
        }
        dispatched
    }

    /// Handle one inbox message.
    pub async fn handle_message(&self, message: BusMessage) -> Result<(), AgentError> {
        match message.message_type {
            MessageType::Directive if message.metadata_bool("recovery") == Some(true) => {
                self.apply_recovery(&message).await;
            }
            MessageType::Directive => {
                let task_id = message
                    .metadata_str("taskId")
                    .map(str::to_string)
                    .unwrap_or_else(|| message.id.clone());
                let added = self
                    .insert_task(
                        task_id.clone(),
                        message.content.clone(),
                        string_list(message.metadata.get("blockedBy")),
                        Some(message.id.clone()),
                        message.conversation_id.clone(),
                        true,
                    )
                    .await;
                if let Err(e) = added {
                    warn!(team_lead = %self.id, "Rejected directive: {}", e);
                    let report = BusMessage::report(
                        &self.id,
                        message.from_agent_id.as_deref(),
                        format!("Task {} rejected: {}", task_id, e),
                        Some(&message.id),
                    )
                    .with_conversation(message.conversation_id.as_deref())
                    .with_metadata("taskId", json!(task_id))
                    .with_metadata("success", json!(false));
                    self.services.bus.send(report)?;
                }
            }
            MessageType::Report => self.on_worker_report(&message).await?,
            _ => {
                debug!(team_lead = %self.id, kind = %message.message_type, "Ignoring message");
                return Ok(());
            }
        }
        self.schedule().await;
        Ok(())
    }

    async fn apply_recovery(&self, message: &BusMessage) {
        info!(team_lead = %self.id, "Applying recovery directive");
        self.board.lock().await.instructions = Some(message.content.clone());

        let open = message
            .metadata
            .get("openTasks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in open {
            let Some(id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            if self.board.lock().await.get(id).is_some() {
                continue;
            }
            let description = entry
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let _ = self
                .insert_task(
                    id.to_string(),
                    description,
                    string_list(entry.get("blockedBy")),
                    Some(id.to_string()),
                    message.conversation_id.clone(),
                    false,
                )
                .await;
        }
    }

    async fn on_worker_report(&self, report: &BusMessage) -> Result<(), AgentError> {
        let Some(worker_id) = report.from_agent_id.clone() else {
            return Ok(());
        };
        if !self.workers().contains_key(&worker_id) {
            debug!(team_lead = %self.id, from = %worker_id, "Report from unknown worker");
            return Ok(());
        }

        let task = {
            let board = self.board.lock().await;
            let by_metadata = report.metadata_str("taskId").and_then(|id| board.get(id));
            by_metadata
                .or_else(|| {
                    board
                        .tasks
                        .iter()
                        .find(|t| t.worker_id.as_deref() == Some(worker_id.as_str()))
                })
                .cloned()
        };
        let Some(task) = task else {
            warn!(team_lead = %self.id, worker_id = %worker_id, "Report matches no task");
            return Ok(());
        };

        if report.metadata_bool("success") != Some(true) {
            return self.complete(&task.id, false, &report.content).await;
        }

        if let Some(t) = self.board.lock().await.get_mut(&task.id) {
            t.state = TaskState::Merging;
            t.summary = Some(report.content.clone());
        }
        match self.services.worktrees.get(&worker_id).await {
            Some(binding) => {
                self.merges
                    .enqueue(MergeRequest {
                        task_id: task.id.clone(),
                        worker_id: worker_id.clone(),
                        branch: binding.branch,
                        worktree_path: binding.worktree_path,
                        blocked_by: task.blocked_by.clone(),
                        message: merge_message(&task),
                    })
                    .await;
            }
            None => {
                self.merges.mark_merged(&task.id).await;
                self.complete(&task.id, true, "No worktree; changes were made in place.")
                    .await?;
            }
        }

        for result in self.merges.process().await {
            let detail = match &result.outcome {
                MergeOutcome::Merged { commit } => format!(
                    "Merged {} into {} ({}).",
                    result.branch,
                    self.merges.trunk(),
                    &commit[..commit.len().min(12)]
                ),
                MergeOutcome::Conflict { detail } => {
                    format!("Merge conflict on {}: {}", result.branch, detail)
                }
                MergeOutcome::Failed(e) => format!("Merge of {} failed: {}", result.branch, e),
            };
            self.complete(&result.task_id, result.outcome.is_merged(), &detail)
                .await?;
        }
        Ok(())
    }

    /// Close a task, release its worker and report to the parent. A failed
    /// task also fails every pending task that depends on it.
    async fn complete(&self, task_id: &str, ok: bool, detail: &str) -> Result<(), AgentError> {
        let (task, doomed) = {
            let mut board = self.board.lock().await;
            let Some(task) = board.get_mut(task_id) else {
                return Ok(());
            };
            task.state = if ok { TaskState::Done } else { TaskState::Failed };
            let task = task.clone();

            let mut doomed = Vec::new();
            if !ok {
                for id in board.dependents_of(task_id) {
                    if let Some(dependent) = board.get_mut(&id) {
                        dependent.state = TaskState::Failed;
                        doomed.push(dependent.clone());
                    }
                }
            }
            (task, doomed)
        };

        if let Some(worker_id) = &task.worker_id {
            self.release_worker(worker_id).await;
        }

        let content = if ok {
            match task.summary.as_deref() {
                Some(summary) => format!("Task {} done.\n\n{}\n\n{}", task.id, summary, detail),
                None => format!("Task {} done.\n\n{}", task.id, detail),
            }
        } else {
            format!("Task {} failed: {}", task.id, detail)
        };
        self.report_task(&task, ok, content)?;

        for dependent in doomed {
            self.merges.remove(&dependent.id).await;
            let content = format!(
                "Task {} failed: blocked by failed task {}",
                dependent.id, task.id
            );
            self.report_task(&dependent, false, content)?;
        }
        Ok(())
    }

    async fn release_worker(&self, worker_id: &str) {
        if let Err(e) = self.services.worktrees.release(worker_id, true).await {
            warn!(worker_id, "Failed to release worktree: {}", e);
        }
        if let Err(e) = self.services.registry.destroy(worker_id) {
            debug!(worker_id, "Worker already gone: {}", e);
        }
        self.workers().remove(worker_id);
    }

    fn report_task(&self, task: &KanbanTask, ok: bool, content: String) -> Result<(), AgentError> {
        let parent = self
            .services
            .registry
            .get(&self.id)
            .and_then(|r| r.parent_id);
        let report = BusMessage::report(
            &self.id,
            parent.as_deref(),
            content,
            task.origin_directive.as_deref(),
        )
        .with_conversation(task.conversation_id.as_deref())
        .with_metadata("taskId", json!(task.id))
        .with_metadata("projectId", json!(self.project.project_id))
        .with_metadata("success", json!(ok));
        self.services.bus.send(report)?;
        Ok(())
    }
}

/// Worker directive: project rules and recovery instructions, then the task.
fn compose_worker_directive(rules: Option<&str>, instructions: Option<&str>, task: &str) -> String {
    let context: Vec<&str> = [rules, instructions]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if context.is_empty() {
        return task.to_string();
    }
    format!("{}\n\n## Task\n{}", context.join("\n\n"), task)
}

fn merge_message(task: &KanbanTask) -> String {
    let title = task.description.lines().next().unwrap_or_default().trim();
    let mut title: String = title.chars().take(72).collect();
    if title.is_empty() {
        title = "worker changes".to_string();
    }
    format!("Task {}: {}", task.id, title)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentStatus;
    use crate::bus::MessageBus;
    use crate::coding::{
        BackendRegistry, CodingAgentClient, CodingAgentTaskResult, CodingBackend, TaskCallbacks,
        TaskErrorCode,
    };
    use crate::git::{Git, WorktreeManager};
    use crate::store::Store;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes `<task>.txt` into its working directory, or fails on request.
    struct FileWriter {
        workdir: PathBuf,
        fail: bool,
    }

    #[async_trait]
    impl CodingAgentClient for FileWriter {
        fn agent_type(&self) -> &str {
            "writer"
        }

        async fn execute_task(&self, task: &str, _callbacks: TaskCallbacks) -> CodingAgentTaskResult {
            if self.fail {
                return CodingAgentTaskResult::failed(TaskErrorCode::ExitFailure, "exit code 1");
            }
            let name = task.lines().last().unwrap_or("task").trim();
            std::fs::write(self.workdir.join(format!("{}.txt", name)), task).unwrap();
            CodingAgentTaskResult::succeeded(format!("wrote {}", name))
        }
    }

    struct WriterBackend {
        fail: bool,
    }

    #[async_trait]
    impl CodingBackend for WriterBackend {
        fn agent_type(&self) -> &str {
            "writer"
        }

        async fn is_ready(&self) -> bool {
            true
        }

        fn client(&self, workdir: &Path, _model: Option<&str>) -> Arc<dyn CodingAgentClient> {
            Arc::new(FileWriter {
                workdir: workdir.to_path_buf(),
                fail: self.fail,
            })
        }
    }

    struct Fixture {
        _temp: TempDir,
        repo: PathBuf,
        services: Arc<AgentServices>,
        reports: Arc<StdMutex<Vec<BusMessage>>>,
    }

    async fn fixture(fail: bool) -> Fixture {
        let temp = TempDir::new().unwrap();
        let git = Git::default();
        let repo = temp.path().join("repo");
        git.init_git_repo(&repo).await.unwrap();
        git.create_initial_commit(&repo).await.unwrap();

        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(WriterBackend { fail }));
        let bus = MessageBus::new(Arc::new(Store::open_in_memory().unwrap()));
        let services = AgentServices::new(bus)
            .with_backends(backends)
            .with_worktrees(WorktreeManager::new(git, Some(temp.path().join("trees"))));

        let reports = Arc::new(StdMutex::new(Vec::new()));
        let sink = reports.clone();
        services
            .bus
            .subscribe("coo", Arc::new(move |m: BusMessage| sink.lock().unwrap().push(m)));

        Fixture {
            repo,
            _temp: temp,
            services: Arc::new(services),
            reports,
        }
    }

    fn lead_record(services: &AgentServices) -> AgentRecord {
        services
            .registry
            .create(AgentRecord::new(AgentRole::TeamLead, Some("coo")).with_project("p1"))
            .unwrap()
    }

    fn project(repo: &Path) -> ProjectSpec {
        ProjectSpec::new("p1", repo).with_coding_agent("writer")
    }

    async fn wait_for_reports(reports: &StdMutex<Vec<BusMessage>>, count: usize) -> Vec<BusMessage> {
        for _ in 0..400 {
            {
                let reports = reports.lock().unwrap();
                if reports.len() >= count {
                    return reports.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {} reports", count);
    }

    #[tokio::test]
    async fn test_add_task_rejects_unknown_dependency() {
        let fx = fixture(false).await;
        let record = lead_record(&fx.services);
        let lead = TeamLead::new(fx.services.clone(), &record, project(&fx.repo));

        let err = lead.add_task("b", vec!["missing".into()]).await.unwrap_err();
        assert!(matches!(err, AgentError::TaskNotFound(ref id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_ready_tasks_follow_dependencies_then_creation_order() {
        let fx = fixture(false).await;
        let record = lead_record(&fx.services);
        let lead = TeamLead::new(fx.services.clone(), &record, project(&fx.repo));

        let a = lead.add_task("a", vec![]).await.unwrap();
        let b = lead.add_task("b", vec![a.clone()]).await.unwrap();
        let c = lead.add_task("c", vec![]).await.unwrap();

        let ready: Vec<String> = lead.ready_tasks().await.into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec![a.clone(), c]);
        let err = lead.dispatch(&b).await.unwrap_err();
        assert!(matches!(err, AgentError::TaskBlocked(_)));
    }

    #[tokio::test]
    async fn test_second_coding_dispatch_refused_while_busy() {
        let fx = fixture(false).await;
        let record = lead_record(&fx.services);
        let lead = TeamLead::new(fx.services.clone(), &record, project(&fx.repo));

        let a = lead.add_task("a", vec![]).await.unwrap();
        let b = lead.add_task("b", vec![]).await.unwrap();
        let worker = lead.dispatch(&a).await.unwrap();

        let err = lead.dispatch(&b).await.unwrap_err();
        assert!(matches!(err, AgentError::ProjectBusy { ref worker_id, .. } if *worker_id == worker));
        assert_eq!(lead.schedule().await, Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_directives_run_merge_and_report_in_order() {
        let fx = fixture(false).await;
        let record = lead_record(&fx.services);
        let lead = TeamLead::spawn(fx.services.clone(), &record, project(&fx.repo));

        let first = fx
            .services
            .bus
            .send(
                BusMessage::directive(Some("coo"), lead.id(), "alpha")
                    .with_conversation(Some("conv")),
            )
            .unwrap();
        let second = fx
            .services
            .bus
            .send(
                BusMessage::directive(Some("coo"), lead.id(), "beta")
                    .with_metadata("blockedBy", json!([first.id])),
            )
            .unwrap();

        let reports = wait_for_reports(&fx.reports, 2).await;
        assert_eq!(reports[0].correlation_id.as_deref(), Some(first.id.as_str()));
        assert_eq!(reports[0].conversation_id.as_deref(), Some("conv"));
        assert_eq!(reports[1].correlation_id.as_deref(), Some(second.id.as_str()));
        assert!(reports.iter().all(|r| r.metadata_bool("success") == Some(true)));
        assert!(reports[0].content.contains("wrote alpha"));

        assert!(fx.repo.join("alpha.txt").exists());
        assert!(fx.repo.join("beta.txt").exists());
        let tasks = lead.tasks().await;
        assert!(tasks.iter().all(|t| t.state == TaskState::Done));

        assert!(fx.services.worktrees.list().await.is_empty());
        let workers: Vec<_> = fx
            .services
            .registry
            .list()
            .into_iter()
            .filter(|a| a.role == AgentRole::Worker)
            .collect();
        assert!(workers.is_empty());
        assert_eq!(
            fx.services.registry.get(lead.id()).unwrap().status,
            AgentStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_failure_cascades_to_dependents() {
        let fx = fixture(true).await;
        let record = lead_record(&fx.services);
        let lead = TeamLead::spawn(fx.services.clone(), &record, project(&fx.repo));

        let first = fx
            .services
            .bus
            .send(BusMessage::directive(Some("coo"), lead.id(), "alpha"))
            .unwrap();
        fx.services
            .bus
            .send(
                BusMessage::directive(Some("coo"), lead.id(), "beta")
                    .with_metadata("blockedBy", json!([first.id])),
            )
            .unwrap();

        let reports = wait_for_reports(&fx.reports, 2).await;
        assert!(reports.iter().all(|r| r.metadata_bool("success") == Some(false)));
        assert!(reports[0].content.contains("WORKER ERROR"));
        assert!(reports[1].content.contains("blocked by failed task"));
        assert!(lead
            .tasks()
            .await
            .iter()
            .all(|t| t.state == TaskState::Failed));
    }

    #[tokio::test]
    async fn test_recovery_directive_restores_open_tasks() {
        let fx = fixture(false).await;
        let record = lead_record(&fx.services);
        let lead = TeamLead::new(fx.services.clone(), &record, project(&fx.repo));

        let mut recovery = BusMessage::directive(Some("coo"), lead.id(), "Project p1 rules")
            .with_metadata("recovery", json!(true))
            .with_metadata(
                "openTasks",
                json!([
                    {"id": "d1", "description": "alpha"},
                    {"id": "d2", "description": "beta", "blockedBy": ["d1", "finished-earlier"]}
                ]),
            );
        recovery.id = "r1".into();
        lead.handle_message(recovery).await.unwrap();

        assert_eq!(lead.instructions().await.as_deref(), Some("Project p1 rules"));
        let tasks = lead.tasks().await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].state, TaskState::Dispatched);
        assert_eq!(tasks[1].blocked_by, vec!["d1".to_string()]);
        assert_eq!(tasks[1].origin_directive.as_deref(), Some("d2"));
    }

    #[test]
    fn test_compose_worker_directive() {
        assert_eq!(compose_worker_directive(None, None, "do it"), "do it");
        assert_eq!(
            compose_worker_directive(Some("Use tabs."), Some(" "), "do it"),
            "Use tabs.\n\n## Task\ndo it"
        );
    }
}
