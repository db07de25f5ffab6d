//! 执行引擎
//!
//! 单任务一个调度循环：依赖图给出就绪步骤，worker 任务并发执行，
//! 信号量限并发，消息回流到循环里改计划状态并逐笔落盘。需要审批的
//! 步骤先过闸门再占并发名额，等人的时候不挡别的步骤。失败重试带
//! 指数退避，彻底失败后停止派发但让在跑的步骤跑完。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::error::BridgeError;
use crate::task::actions::{ActionContext, ActionRegistry};
use crate::task::graph::StepGraph;
use crate::task::persistence::TaskStore;
use crate::task::types::{
    AppliedAction, PersistedTaskState, RollbackFailureEntry, RollbackReport, StepStatus, TaskPlan,
    TaskResult, TaskStatus, TaskStep, UndoAction,
};

/// 审批途径
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalMode {
    /// 全部放行，测试与无人值守场景
    Auto,
    /// 等对端通过 approve/reject 调用裁决
    Channel,
    /// 本地终端问一句
    Console,
    /// POST 到外部服务，回 {"approved": bool}
    Webhook { url: String },
}

#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    pub mode: ApprovalMode,
    /// 毫秒，0 表示一直等
    pub timeout_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::Channel,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_parallel_steps: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub step_timeout_secs: u64,
    /// 拒批后是否放弃整个任务（默认只跳过该步及其后继）
    pub abort_on_denial: bool,
    pub approval: ApprovalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 2,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            step_timeout_secs: 300,
            abort_on_denial: false,
            approval: ApprovalConfig::default(),
        }
    }
}

/// 引擎对外的执行事件流
#[derive(Debug, Clone)]
pub enum StepEvent {
    TaskStarted { task_id: String, title: String, steps: usize },
    StepStarted { task_id: String, step_id: String },
    StepCompleted { task_id: String, step_id: String },
    StepRetrying { task_id: String, step_id: String, attempt: u32 },
    StepFailed { task_id: String, step_id: String, error: String },
    ApprovalRequested { task_id: String, step_id: String },
    ApprovalResolved { task_id: String, step_id: String, approved: bool },
    RollbackStep { task_id: String, step_id: String, ok: bool },
    TaskFinished { task_id: String, status: TaskStatus },
}

/// worker 回传给调度循环的消息。Denied/Completed/Failed/Aborted 是终态
enum StepMsg {
    AwaitingApproval { step_id: String },
    Approved { step_id: String },
    Denied { step_id: String },
    Started { step_id: String },
    Retrying { step_id: String, attempt: u32, error: String },
    Completed { step_id: String, retry_count: u32, undo: Option<UndoAction> },
    Failed { step_id: String, retry_count: u32, error: String },
    Aborted { step_id: String },
}

fn key(task_id: &str, step_id: &str) -> String {
    format!("{task_id}:{step_id}")
}

/// 审批闸门：按配置的途径拿一个放行/拒绝的裁决，超时一律按拒绝处理
pub struct ApprovalGate {
    config: ApprovalConfig,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    http: reqwest::Client,
}

impl ApprovalGate {
    pub fn new(config: ApprovalConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    pub async fn request(&self, task_id: &str, step: &TaskStep) -> bool {
        match &self.config.mode {
            ApprovalMode::Auto => true,
            ApprovalMode::Channel => self.wait_channel(key(task_id, &step.id)).await,
            ApprovalMode::Console => self.ask_console(task_id, step).await,
            ApprovalMode::Webhook { url } => self.ask_webhook(url, task_id, step).await,
        }
    }

    /// 外部裁决入口，返回是否有在等的步骤
    pub async fn resolve(&self, task_id: &str, step_id: &str, approved: bool) -> bool {
        let sender = self.pending.lock().await.remove(&key(task_id, step_id));
        match sender {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    /// 等待方中途放弃（任务被取消）时清掉挂起条目，不然死键留在表里
    pub async fn discard(&self, task_id: &str, step_id: &str) {
        self.pending.lock().await.remove(&key(task_id, step_id));
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn wait_channel(&self, key: String) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        let decision = if self.config.timeout_ms == 0 {
            rx.await.unwrap_or(false)
        } else {
            match tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), rx).await {
                Ok(Ok(approved)) => approved,
                _ => false,
            }
        };
        self.pending.lock().await.remove(&key);
        decision
    }

    async fn ask_console(&self, task_id: &str, step: &TaskStep) -> bool {
        let desc = step
            .description
            .clone()
            .unwrap_or_else(|| step.action.to_string());
        let task = task_id.to_string();
        let step_id = step.id.clone();
        let prompt = tokio::task::spawn_blocking(move || {
            println!("task {task} step {step_id} requires approval: {desc}");
            println!("approve? [y/N]");
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(_) => {
                    let answer = line.trim().to_lowercase();
                    answer == "y" || answer == "yes" || answer == "是"
                }
                Err(_) => false,
            }
        });

        if self.config.timeout_ms == 0 {
            prompt.await.unwrap_or(false)
        } else {
            match tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), prompt).await {
                Ok(Ok(approved)) => approved,
                _ => false,
            }
        }
    }

    async fn ask_webhook(&self, url: &str, task_id: &str, step: &TaskStep) -> bool {
        let payload = serde_json::json!({
            "taskId": task_id,
            "step": step,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        let timeout_ms = if self.config.timeout_ms == 0 {
            30_000
        } else {
            self.config.timeout_ms
        };

        let request = self.http.post(url).json(&payload).send();
        let response = match tokio::time::timeout(Duration::from_millis(timeout_ms), request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                warn!(error = %err, "approval webhook unreachable, denying");
                return false;
            }
            Err(_) => {
                warn!("approval webhook timed out, denying");
                return false;
            }
        };
        match response.json::<serde_json::Value>().await {
            Ok(body) => body.get("approved").and_then(|v| v.as_bool()).unwrap_or(false),
            Err(err) => {
                warn!(error = %err, "approval webhook returned invalid body, denying");
                false
            }
        }
    }
}

pub struct ExecutionEngine {
    config: EngineConfig,
    registry: Arc<ActionRegistry>,
    store: Arc<dyn TaskStore>,
    ctx: Arc<ActionContext>,
    gate: Arc<ApprovalGate>,
    active: Arc<Mutex<HashSet<String>>>,
    /// 任务 id → 已应用的副作用，回滚时逆序撤销
    journals: Arc<Mutex<HashMap<String, Vec<AppliedAction>>>>,
    cancels: Arc<Mutex<HashMap<String, CancellationToken>>>,
    paused: watch::Sender<bool>,
    events: broadcast::Sender<StepEvent>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        registry: ActionRegistry,
        store: Arc<dyn TaskStore>,
        ctx: ActionContext,
    ) -> Result<Self, BridgeError> {
        registry.validate_complete()?;
        let (paused, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            gate: Arc::new(ApprovalGate::new(config.approval.clone())),
            config,
            registry: Arc::new(registry),
            store,
            ctx: Arc::new(ctx),
            active: Arc::new(Mutex::new(HashSet::new())),
            journals: Arc::new(Mutex::new(HashMap::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            paused,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.events.subscribe()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub async fn approve(&self, task_id: &str, step_id: &str) -> bool {
        self.gate.resolve(task_id, step_id, true).await
    }

    pub async fn reject(&self, task_id: &str, step_id: &str) -> bool {
        self.gate.resolve(task_id, step_id, false).await
    }

    /// 取消在跑的任务，返回是否找到了它
    pub async fn cancel(&self, task_id: &str) -> bool {
        let cancels = self.cancels.lock().await;
        match cancels.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.active.lock().await.contains(task_id)
    }

    /// 还卡在审批上的步骤数
    pub async fn pending_approvals(&self) -> usize {
        self.gate.pending_count().await
    }

    pub async fn list_resumable(&self) -> Result<Vec<PersistedTaskState>, BridgeError> {
        self.store.get_persisted_tasks().await
    }

    pub async fn execute(&self, mut plan: TaskPlan, user_request: &str) -> Result<TaskResult, BridgeError> {
        {
            let mut active = self.active.lock().await;
            if !active.insert(plan.id.clone()) {
                return Err(BridgeError::Validation(format!(
                    "task {} is already executing",
                    plan.id
                )));
            }
        }
        let token = CancellationToken::new();
        self.cancels.lock().await.insert(plan.id.clone(), token.clone());

        let result = self.run_plan(&mut plan, user_request, token).await;

        self.cancels.lock().await.remove(&plan.id);
        self.active.lock().await.remove(&plan.id);
        result
    }

    /// 从落盘快照恢复：已完成的步骤不重跑，其余重置后再执行
    pub async fn resume_task(&self, task_id: &str) -> Result<TaskResult, BridgeError> {
        let Some(state) = self.store.get_persisted_task(task_id).await? else {
            return Err(BridgeError::Validation(format!(
                "no persisted state for task {task_id}"
            )));
        };
        let mut plan = state.original_task.clone();
        let completed: HashSet<&String> = state.completed_steps.iter().collect();
        for step in &mut plan.steps {
            if completed.contains(&step.id) || step.status == StepStatus::Completed {
                step.status = StepStatus::Completed;
            } else {
                step.status = StepStatus::Pending;
                step.retry_count = 0;
                step.error = None;
            }
        }
        info!(
            task_id = %task_id,
            completed = state.completed_steps.len(),
            total = plan.steps.len(),
            "resuming task"
        );
        self.execute(plan, &state.metadata.user_request).await
    }

    /// 逆序撤销 journal 里的副作用。单条失败不中断，记进报告继续
    pub async fn rollback(&self, task_id: &str) -> Result<RollbackReport, BridgeError> {
        let journal = self.journals.lock().await.remove(task_id).unwrap_or_default();
        if journal.is_empty() {
            debug!(task_id = %task_id, "nothing to roll back");
            return Ok(RollbackReport {
                task_id: task_id.to_string(),
                reversed: Vec::new(),
                failed: Vec::new(),
            });
        }

        let mut reversed = Vec::new();
        let mut failed = Vec::new();
        for applied in journal.into_iter().rev() {
            match self.apply_undo(&applied.undo).await {
                Ok(()) => {
                    self.emit(StepEvent::RollbackStep {
                        task_id: task_id.to_string(),
                        step_id: applied.step_id.clone(),
                        ok: true,
                    });
                    reversed.push(applied.step_id);
                }
                Err(err) => {
                    warn!(task_id = %task_id, step_id = %applied.step_id, error = %err, "undo failed");
                    self.emit(StepEvent::RollbackStep {
                        task_id: task_id.to_string(),
                        step_id: applied.step_id.clone(),
                        ok: false,
                    });
                    failed.push(RollbackFailureEntry {
                        step_id: applied.step_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(task_id = %task_id, reversed = reversed.len(), failed = failed.len(), "rollback finished");
        Ok(RollbackReport {
            task_id: task_id.to_string(),
            reversed,
            failed,
        })
    }

    async fn apply_undo(&self, undo: &UndoAction) -> Result<(), BridgeError> {
        match undo {
            UndoAction::RemoveFile { path } => {
                // 文件已经没了就算撤销成功
                if !self.ctx.fs.exists(path).await {
                    return Ok(());
                }
                self.ctx.fs.delete(path).await
            }
            UndoAction::RestoreFile { path, prior } => self.ctx.fs.write(path, prior).await,
            UndoAction::RemoveDir { path } => self.ctx.fs.remove_dir(path).await,
        }
        .map_err(|err| BridgeError::RollbackFailure(err.to_string()))
    }

    async fn run_plan(
        &self,
        plan: &mut TaskPlan,
        user_request: &str,
        token: CancellationToken,
    ) -> Result<TaskResult, BridgeError> {
        let task_id = plan.id.clone();
        let mut graph = StepGraph::build(&plan.steps)?;

        self.emit(StepEvent::TaskStarted {
            task_id: task_id.clone(),
            title: plan.title.clone(),
            steps: plan.steps.len(),
        });
        info!(task_id = %task_id, steps = plan.steps.len(), "task started");
        self.persist(plan, user_request).await;

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_steps.max(1)));
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<StepMsg>();
        let mut pause_rx = self.paused.subscribe();

        let mut ready: VecDeque<String> = graph.ready().into();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut in_flight = 0usize;
        let mut stop_dispatch = false;
        let mut denied_any = false;
        let mut cancelled = false;
        let mut exec_failed: Option<(String, String)> = None;

        loop {
            if !stop_dispatch && !*pause_rx.borrow() {
                while let Some(step_id) = ready.pop_front() {
                    if scheduled.contains(&step_id) || graph.is_done(&step_id) {
                        continue;
                    }
                    let Some(step) = plan.step(&step_id) else { continue };
                    scheduled.insert(step_id.clone());
                    in_flight += 1;
                    self.spawn_step(
                        step.clone(),
                        task_id.clone(),
                        semaphore.clone(),
                        msg_tx.clone(),
                        token.clone(),
                    );
                }
            }

            if in_flight == 0 && (stop_dispatch || ready.is_empty()) {
                break;
            }

            tokio::select! {
                Some(msg) = msg_rx.recv() => {
                    match msg {
                        StepMsg::AwaitingApproval { step_id } => {
                            if let Some(step) = step_mut(plan, &step_id) {
                                step.status = StepStatus::AwaitingApproval;
                            }
                            info!(task_id = %task_id, step_id = %step_id, "step awaiting approval");
                            self.emit(StepEvent::ApprovalRequested {
                                task_id: task_id.clone(),
                                step_id,
                            });
                            self.persist(plan, user_request).await;
                        }
                        StepMsg::Approved { step_id } => {
                            self.emit(StepEvent::ApprovalResolved {
                                task_id: task_id.clone(),
                                step_id,
                                approved: true,
                            });
                        }
                        StepMsg::Denied { step_id } => {
                            in_flight -= 1;
                            denied_any = true;
                            if let Some(step) = step_mut(plan, &step_id) {
                                step.status = StepStatus::Failed;
                                step.error = Some(BridgeError::ApprovalDenied(step_id.clone()).to_string());
                            }
                            warn!(task_id = %task_id, step_id = %step_id, "step denied by approver");
                            self.emit(StepEvent::ApprovalResolved {
                                task_id: task_id.clone(),
                                step_id,
                                approved: false,
                            });
                            if self.config.abort_on_denial {
                                stop_dispatch = true;
                            }
                            self.persist(plan, user_request).await;
                        }
                        StepMsg::Started { step_id } => {
                            if let Some(step) = step_mut(plan, &step_id) {
                                step.status = StepStatus::Running;
                            }
                            debug!(task_id = %task_id, step_id = %step_id, "step started");
                            self.emit(StepEvent::StepStarted {
                                task_id: task_id.clone(),
                                step_id,
                            });
                            self.persist(plan, user_request).await;
                        }
                        StepMsg::Retrying { step_id, attempt, error } => {
                            if let Some(step) = step_mut(plan, &step_id) {
                                step.retry_count = attempt;
                                step.error = Some(error.clone());
                            }
                            warn!(task_id = %task_id, step_id = %step_id, attempt, error = %error, "step retrying");
                            self.emit(StepEvent::StepRetrying {
                                task_id: task_id.clone(),
                                step_id,
                                attempt,
                            });
                            self.persist(plan, user_request).await;
                        }
                        StepMsg::Completed { step_id, retry_count, undo } => {
                            in_flight -= 1;
                            if let Some(step) = step_mut(plan, &step_id) {
                                step.status = StepStatus::Completed;
                                step.retry_count = retry_count;
                                step.error = None;
                            }
                            if let Some(undo) = undo {
                                self.journals
                                    .lock()
                                    .await
                                    .entry(task_id.clone())
                                    .or_default()
                                    .push(AppliedAction { step_id: step_id.clone(), undo });
                            }
                            debug!(task_id = %task_id, step_id = %step_id, "step completed");
                            self.emit(StepEvent::StepCompleted {
                                task_id: task_id.clone(),
                                step_id: step_id.clone(),
                            });
                            for unlocked in graph.mark_completed(&step_id) {
                                ready.push_back(unlocked);
                            }
                            self.persist(plan, user_request).await;
                        }
                        StepMsg::Failed { step_id, retry_count, error: step_error } => {
                            in_flight -= 1;
                            if let Some(step) = step_mut(plan, &step_id) {
                                step.status = StepStatus::Failed;
                                step.retry_count = retry_count;
                                step.error = Some(step_error.clone());
                            }
                            error!(task_id = %task_id, step_id = %step_id, error = %step_error, "step failed");
                            self.emit(StepEvent::StepFailed {
                                task_id: task_id.clone(),
                                step_id: step_id.clone(),
                                error: step_error.clone(),
                            });
                            if exec_failed.is_none() {
                                exec_failed = Some((step_id, step_error));
                            }
                            stop_dispatch = true;
                            self.persist(plan, user_request).await;
                        }
                        StepMsg::Aborted { step_id } => {
                            in_flight -= 1;
                            if let Some(step) = step_mut(plan, &step_id) {
                                if step.status != StepStatus::Completed {
                                    step.status = StepStatus::Pending;
                                }
                            }
                            debug!(task_id = %task_id, step_id = %step_id, "step aborted");
                        }
                    }
                }
                _ = token.cancelled(), if !cancelled => {
                    cancelled = true;
                    stop_dispatch = true;
                    info!(task_id = %task_id, "task cancelled");
                }
                _ = pause_rx.changed() => {
                    let paused_now = *pause_rx.borrow();
                    info!(task_id = %task_id, paused = paused_now, "pause state changed");
                }
            }
        }

        let completed_steps = plan.completed_step_ids();
        let status = if cancelled {
            TaskStatus::Cancelled
        } else if exec_failed.is_some() {
            TaskStatus::Failed
        } else if denied_any || plan.steps.iter().any(|s| s.status != StepStatus::Completed) {
            TaskStatus::PartiallyCompleted
        } else {
            TaskStatus::Completed
        };

        match status {
            TaskStatus::Completed => {
                if let Err(err) = self.store.remove_persisted_task(&task_id).await {
                    warn!(task_id = %task_id, error = %err, "failed to drop task record");
                }
                self.journals.lock().await.remove(&task_id);
            }
            TaskStatus::Cancelled => {
                // 记录删掉，回滚日志留着，取消后还可以撤销已做的修改
                if let Err(err) = self.store.remove_persisted_task(&task_id).await {
                    warn!(task_id = %task_id, error = %err, "failed to drop task record");
                }
            }
            _ => {
                self.persist(plan, user_request).await;
            }
        }

        let rollback_available = self
            .journals
            .lock()
            .await
            .get(&task_id)
            .map(|j| !j.is_empty())
            .unwrap_or(false);
        let last_completed_step = completed_steps.last().cloned();

        self.emit(StepEvent::TaskFinished {
            task_id: task_id.clone(),
            status,
        });
        info!(task_id = %task_id, ?status, completed = completed_steps.len(), "task finished");

        Ok(TaskResult {
            task_id,
            status,
            completed_steps,
            last_completed_step,
            failed_step: exec_failed.as_ref().map(|(id, _)| id.clone()),
            error: match (&exec_failed, cancelled) {
                (Some((_, err)), _) => Some(err.clone()),
                (None, true) => Some("task cancelled".to_string()),
                _ => None,
            },
            rollback_available,
            steps: plan.steps.clone(),
        })
    }

    fn spawn_step(
        &self,
        step: TaskStep,
        task_id: String,
        semaphore: Arc<Semaphore>,
        msg_tx: mpsc::UnboundedSender<StepMsg>,
        token: CancellationToken,
    ) {
        let registry = self.registry.clone();
        let ctx = self.ctx.clone();
        let gate = self.gate.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let step_id = step.id.clone();
            let tx = msg_tx.clone();
            let worker = tokio::spawn(run_step(
                step, task_id, registry, ctx, gate, config, semaphore, msg_tx, token,
            ));
            // run_step 的终态消息都在 return 前最后一刻发，panic 即一条没发。
            // 这里补一个 Failed，调度循环的 in_flight 才能归零
            if let Err(err) = worker.await {
                if err.is_panic() {
                    let _ = tx.send(StepMsg::Failed {
                        step_id,
                        retry_count: 0,
                        error: "step handler panicked".to_string(),
                    });
                }
            }
        });
    }

    async fn persist(&self, plan: &TaskPlan, user_request: &str) {
        let root = self.ctx.fs.root().to_string_lossy().to_string();
        let state =
            PersistedTaskState::capture(plan, &plan.completed_step_ids(), user_request, Some(&root));
        if let Err(err) = self.store.save_task_state(&state).await {
            warn!(task_id = %plan.id, error = %err, "failed to persist task state");
        }
    }

    fn emit(&self, event: StepEvent) {
        let _ = self.events.send(event);
    }
}

fn step_mut<'a>(plan: &'a mut TaskPlan, step_id: &str) -> Option<&'a mut TaskStep> {
    plan.steps.iter_mut().find(|s| s.id == step_id)
}

fn retry_delay(base_ms: u64, attempt: u32, max_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1u64 << exp).min(max_ms))
}

#[allow(clippy::too_many_arguments)]
async fn run_step(
    step: TaskStep,
    task_id: String,
    registry: Arc<ActionRegistry>,
    ctx: Arc<ActionContext>,
    gate: Arc<ApprovalGate>,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    msg_tx: mpsc::UnboundedSender<StepMsg>,
    token: CancellationToken,
) {
    let step_id = step.id.clone();

    if step.requires_approval {
        let _ = msg_tx.send(StepMsg::AwaitingApproval { step_id: step_id.clone() });
        let approved = tokio::select! {
            _ = token.cancelled() => {
                // 等待的 future 已被丢弃，裁决通道的挂起条目要跟着清掉
                gate.discard(&task_id, &step.id).await;
                let _ = msg_tx.send(StepMsg::Aborted { step_id });
                return;
            }
            approved = gate.request(&task_id, &step) => approved,
        };
        if !approved {
            let _ = msg_tx.send(StepMsg::Denied { step_id });
            return;
        }
        let _ = msg_tx.send(StepMsg::Approved { step_id: step_id.clone() });
    }

    let _permit = tokio::select! {
        _ = token.cancelled() => {
            let _ = msg_tx.send(StepMsg::Aborted { step_id });
            return;
        }
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                let _ = msg_tx.send(StepMsg::Aborted { step_id });
                return;
            }
        },
    };

    let _ = msg_tx.send(StepMsg::Started { step_id: step_id.clone() });

    let Some(handler) = registry.get(step.action) else {
        // 注册表在引擎构造时校验过，这里只是兜底
        let _ = msg_tx.send(StepMsg::Failed {
            step_id,
            retry_count: 0,
            error: format!("no handler for action {}", step.action),
        });
        return;
    };

    let step_timeout = Duration::from_secs(config.step_timeout_secs.max(1));
    let mut retries: u32 = 0;
    loop {
        let attempt_result = tokio::select! {
            _ = token.cancelled() => {
                let _ = msg_tx.send(StepMsg::Aborted { step_id });
                return;
            }
            result = tokio::time::timeout(step_timeout, handler.execute(&step.params, &ctx)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(BridgeError::Timeout(format!(
                        "step timed out after {}s",
                        config.step_timeout_secs
                    ))),
                }
            }
        };

        match attempt_result {
            Ok(outcome) => {
                let _ = msg_tx.send(StepMsg::Completed {
                    step_id,
                    retry_count: retries,
                    undo: outcome.undo,
                });
                return;
            }
            Err(err) => {
                if retries >= config.max_retries {
                    let _ = msg_tx.send(StepMsg::Failed {
                        step_id,
                        retry_count: retries,
                        error: err.to_string(),
                    });
                    return;
                }
                retries += 1;
                let _ = msg_tx.send(StepMsg::Retrying {
                    step_id: step_id.clone(),
                    attempt: retries,
                    error: err.to_string(),
                });
                let delay = retry_delay(config.retry_base_delay_ms, retries, config.retry_max_delay_ms);
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = msg_tx.send(StepMsg::Aborted { step_id });
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
