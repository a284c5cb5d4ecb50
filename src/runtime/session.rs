//! 会话编排器（RuntimeSession）
//!
//! 每个会话一个后台 actor，独占该会话的参与者状态（冷却计数、阶段），从串行收件箱按到达顺序
//! 处理消息。`stop` 不经过收件箱：直接取消当前轮次的 token，执行器在边界处观察到后结束。
//!
//! 一条用户消息的处理（一个 cycle）：
//! 1. 追加用户消息到会话日志，turn_index + 1
//! 2. 读取名册快照，对齐参与者，按最宽窗口取历史快照，解析提及
//! 3. 调度器选人；顺序模式逐个执行（后发言者能看到前面的回复），并行模式最多 P 个同时执行
//! 4. 每个角色结束后追加其回复（被打断的标记 partial），结算冷却
//! 5. max_exchanges > 1 时以最后一条回复为触发继续下一轮，除非已有新的用户消息排队
//!
//! 会话正在处理时提交的停止指令（`/stop`、`结束` 等）直接转为 `stop`，不作为新消息入队。

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::stream::FuturesOrdered;
use futures_util::{Stream, StreamExt};
use regex::Regex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentExecutor, AgentOutcome, AgentStatus, EventSink, StreamEvent};
use crate::config::{AppConfig, SessionSection};
use crate::core::{DispatchMode, SessionError, SessionSupervisor, TaskScheduler};
use crate::llm::LlmProfiles;
use crate::memory::{window, Message, MessageStore};
use crate::persona::{PersonaId, PersonaRoster, PersonaStore};
use crate::scheduler::{self, extract_mentions, SessionParticipant, TurnContext, TurnScheduler};
use crate::tools::ToolDispatcher;

const OBSERVER_CAPACITY: usize = 256;

/// 用户显式停止指令对应的停止原因
pub const EXPLICIT_STOP_REASON: &str = "user_explicit_stop";

static STOP_COMMAND_RE: OnceLock<Regex> = OnceLock::new();

/// 是否为停止指令：`/stop`、`stop`、`结束`、`终止`、`强制停止`、`停止对话`，允许句末标点
pub fn is_stop_command(text: &str) -> bool {
    STOP_COMMAND_RE
        .get_or_init(|| {
            Regex::new(r"(?i)^\s*(?:/stop|stop|结束|终止|强制停止|停止对话)\s*[。.!！]*\s*$").unwrap()
        })
        .is_match(text)
}

/// 所有会话共享的协作者
#[derive(Clone)]
pub struct SessionServices {
    pub personas: Arc<dyn PersonaStore>,
    pub messages: Arc<dyn MessageStore>,
    pub executor: Arc<AgentExecutor>,
    pub scheduler: TurnScheduler,
    pub settings: SessionSection,
}

impl SessionServices {
    /// 按配置组装：调度权重、执行器限制、会话设置
    pub fn from_config(
        cfg: &AppConfig,
        personas: Arc<dyn PersonaStore>,
        messages: Arc<dyn MessageStore>,
        llm: LlmProfiles,
        tools: Arc<dyn ToolDispatcher>,
    ) -> Self {
        Self {
            personas,
            messages,
            executor: Arc::new(AgentExecutor::new(llm, tools, cfg.executor.clone())),
            scheduler: TurnScheduler::new(cfg.scheduler.clone()),
            settings: cfg.session.clone(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: TurnScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// 收件箱命令
enum Command {
    Submit {
        message: Message,
        events: mpsc::UnboundedSender<StreamEvent>,
    },
    Shutdown,
}

/// 一次 submit 的事件流；该消息处理完毕（含后续交流轮）后结束
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EventStream {
    /// 收集到流结束
    pub async fn collect_all(mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.rx.recv().await {
            out.push(ev);
        }
        out
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// 会话句柄，可克隆；所有克隆指向同一个 actor
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    supervisor: Arc<SessionSupervisor>,
    observers: broadcast::Sender<StreamEvent>,
    pending: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    last_active: Arc<Mutex<Instant>>,
    participants: watch::Receiver<Vec<SessionParticipant>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 提交一条用户消息，返回该消息触发的事件流
    ///
    /// 处理中收到停止指令时改为 `stop(EXPLICIT_STOP_REASON)`：指令本身不入日志，返回的事件流
    /// 直接结束，`session.stopped` 发往被打断的那次提交。
    pub async fn submit(&self, message: Message) -> Result<EventStream, SessionError> {
        if self.busy.load(Ordering::SeqCst) && is_stop_command(&message.content) {
            self.stop(EXPLICIT_STOP_REASON).await;
            let (_, rx) = mpsc::unbounded_channel();
            return Ok(EventStream { rx });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut t) = self.last_active.lock() {
            *t = Instant::now();
        }
        if self
            .commands
            .send(Command::Submit {
                message,
                events: tx,
            })
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(SessionError::Closed(self.session_id.clone()));
        }
        Ok(EventStream { rx })
    }

    /// 停止当前轮次；空闲时直接向观察者广播 session.stopped。返回是否打断了进行中的轮次
    pub async fn stop(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        info!(session = %self.session_id, reason = %reason, "stop requested");
        if self.supervisor.stop(reason.clone()).await {
            return true;
        }
        let _ = self.observers.send(StreamEvent::SessionStopped { reason });
        false
    }

    /// 订阅该会话的全部事件（转发给传输层）
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.observers.subscribe()
    }

    /// 关闭会话：取消进行中的轮次，actor 处理完收件箱里的关闭命令后退出
    pub fn shutdown(&self) {
        self.supervisor.shutdown();
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// 正在处理或有消息排队
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst) || self.pending.load(Ordering::SeqCst) > 0
    }

    /// 参与者状态快照（冷却计数、阶段）
    pub fn participants(&self) -> Vec<SessionParticipant> {
        self.participants.borrow().clone()
    }

    /// 订阅参与者状态变化
    pub fn watch_participants(&self) -> watch::Receiver<Vec<SessionParticipant>> {
        self.participants.clone()
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_active
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

/// 会话 actor
pub struct RuntimeSession {
    session_id: String,
    services: SessionServices,
    supervisor: Arc<SessionSupervisor>,
    observers: broadcast::Sender<StreamEvent>,
    pending: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    participants: Vec<SessionParticipant>,
    roster: Arc<PersonaRoster>,
    turn_index: u64,
    permits: TaskScheduler,
    participant_view: watch::Sender<Vec<SessionParticipant>>,
}

impl RuntimeSession {
    /// 校验名册并启动 actor；名册结构非法时会话不启动
    pub async fn start(
        session_id: impl Into<String>,
        services: SessionServices,
    ) -> Result<SessionHandle, SessionError> {
        let session_id = session_id.into();
        let roster = services.personas.load_roster(&session_id).await?;
        roster
            .validate_structure()
            .map_err(SessionError::InvalidConfig)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        let supervisor = Arc::new(SessionSupervisor::new());
        let pending = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicBool::new(false));

        let mut participants = Vec::new();
        scheduler::reconcile(&mut participants, &roster);
        let (participant_view, participant_rx) = watch::channel(participants.clone());
        let permits = TaskScheduler::for_mode(
            services.settings.dispatch_mode,
            services.settings.parallelism,
        );

        let actor = RuntimeSession {
            session_id: session_id.clone(),
            services,
            supervisor: Arc::clone(&supervisor),
            observers: observers.clone(),
            pending: Arc::clone(&pending),
            busy: Arc::clone(&busy),
            participants,
            roster: Arc::new(roster),
            turn_index: 0,
            permits,
            participant_view,
        };
        info!(session = %session_id, personas = actor.roster.personas.len(), "session started");
        tokio::spawn(actor.run(cmd_rx));

        Ok(SessionHandle {
            session_id,
            commands: cmd_tx,
            supervisor,
            observers,
            pending,
            busy,
            last_active: Arc::new(Mutex::new(Instant::now())),
            participants: participant_rx,
        })
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = inbox.recv().await {
            match cmd {
                Command::Submit { message, events } => {
                    self.busy.store(true, Ordering::SeqCst);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    if self.supervisor.is_shutdown() {
                        debug!(session = %self.session_id, "session shut down, dropping message");
                        self.busy.store(false, Ordering::SeqCst);
                    } else {
                        let sink = EventSink::new(Some(events), Some(self.observers.clone()));
                        self.handle_message(message, &sink).await;
                        // 先清忙碌标记再关闭事件流，流结束后紧接着的 "stop" 按普通消息处理
                        self.busy.store(false, Ordering::SeqCst);
                        drop(sink);
                    }
                }
                Command::Shutdown => break,
            }
        }
        info!(session = %self.session_id, "session closed");
    }

    async fn handle_message(&mut self, message: Message, sink: &EventSink) {
        let cancel = self.supervisor.begin_cycle().await;
        self.append(message.clone()).await;

        let mut trigger = message;
        for exchange in 0..self.services.settings.max_exchanges.max(1) {
            if exchange > 0 && self.pending.load(Ordering::SeqCst) > 0 {
                info!(session = %self.session_id, "user message queued, ending exchange early");
                break;
            }
            let replies = self.run_cycle(&trigger, &cancel, sink).await;
            if cancel.is_cancelled() {
                break;
            }
            match replies.into_iter().last() {
                Some(last) => trigger = last,
                None => break,
            }
        }

        if let Some(reason) = self.supervisor.end_cycle().await {
            info!(session = %self.session_id, reason = %reason, "cycle stopped");
            sink.emit(StreamEvent::SessionStopped { reason });
        }
    }

    /// 执行一个轮次，返回本轮完整结束的回复（按发言顺序）
    async fn run_cycle(
        &mut self,
        trigger: &Message,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> Vec<Message> {
        self.turn_index += 1;
        self.refresh_roster().await;
        let roster = Arc::clone(&self.roster);
        scheduler::reconcile(&mut self.participants, &roster);

        let widest = window::widest(roster.personas.iter().map(|p| p.memory_window));
        let history = match self.services.messages.tail(&self.session_id, widest).await {
            Ok(h) => h,
            Err(e) => {
                error!(session = %self.session_id, error = %e, "failed to read history");
                vec![trigger.clone()]
            }
        };
        let ctx = TurnContext {
            session_id: self.session_id.clone(),
            turn_index: self.turn_index,
            mentioned: extract_mentions(trigger, &roster),
            trigger: trigger.clone(),
            history,
        };

        let selected = self
            .services
            .scheduler
            .select(&ctx, &self.participants, &roster);
        for handle in &selected {
            if let Some(p) = self.participant_mut(handle) {
                p.select();
            }
        }
        self.publish_participants();

        let outcomes = match self.services.settings.dispatch_mode {
            DispatchMode::Sequential => self.run_sequential(ctx, &roster, &selected, cancel, sink).await,
            DispatchMode::Parallel => self.run_parallel(ctx, &roster, &selected, cancel, sink).await,
        };

        let mut replies = Vec::new();
        for (outcome, message) in outcomes {
            if outcome.status.is_completed() {
                if let Some(m) = message {
                    replies.push(m);
                }
            }
        }
        scheduler::settle_cooldowns(&mut self.participants, &roster);
        self.publish_participants();
        replies
    }

    async fn run_sequential(
        &mut self,
        mut ctx: TurnContext,
        roster: &Arc<PersonaRoster>,
        selected: &[PersonaId],
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> Vec<(AgentOutcome, Option<Message>)> {
        let mut outcomes = Vec::new();
        for handle in selected {
            if cancel.is_cancelled() {
                debug!(session = %self.session_id, persona = %handle, "skipped after stop");
                continue;
            }
            let Some(persona) = roster.get(handle) else { continue };
            self.mark_speaking(handle);
            let outcome = self
                .services
                .executor
                .execute(persona, roster, &ctx, cancel, sink)
                .await;
            let message = self.record(&outcome).await;
            if let Some(m) = &message {
                ctx.history.push(m.clone());
            }
            outcomes.push((outcome, message));
        }
        outcomes
    }

    async fn run_parallel(
        &mut self,
        ctx: TurnContext,
        roster: &Arc<PersonaRoster>,
        selected: &[PersonaId],
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> Vec<(AgentOutcome, Option<Message>)> {
        let ctx = Arc::new(ctx);
        // 任务拿到许可、即将开口时上报，编排器据此把角色切到 Speaking
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<PersonaId>();
        let mut tasks = Vec::new();
        for handle in selected {
            let Some(persona) = roster.get(handle).cloned() else { continue };
            let executor = Arc::clone(&self.services.executor);
            let roster = Arc::clone(roster);
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            let sink = sink.clone();
            let permits = self.permits.clone();
            let started = started_tx.clone();
            let task = tokio::spawn(async move {
                let _permit = permits.acquire().await?;
                if cancel.is_cancelled() {
                    return None;
                }
                let _ = started.send(persona.handle.clone());
                Some(executor.execute(&persona, &roster, &ctx, &cancel, &sink).await)
            });
            tasks.push((handle.clone(), task));
        }
        drop(started_tx);

        let mut joins: FuturesOrdered<_> = tasks
            .into_iter()
            .map(|(handle, task)| async move { (handle, task.await) })
            .collect();
        let mut finished = Vec::new();
        loop {
            tokio::select! {
                Some(handle) = started_rx.recv() => self.mark_speaking(&handle),
                next = joins.next() => match next {
                    Some(done) => finished.push(done),
                    None => break,
                },
            }
        }
        while let Ok(handle) = started_rx.try_recv() {
            self.mark_speaking(&handle);
        }

        let mut outcomes = Vec::new();
        for (handle, joined) in finished {
            let outcome = match joined {
                Ok(Some(outcome)) => outcome,
                Ok(None) => {
                    debug!(session = %self.session_id, persona = %handle, "skipped after stop");
                    continue;
                }
                Err(e) => {
                    error!(session = %self.session_id, persona = %handle, error = %e, "executor task failed");
                    let outcome = AgentOutcome {
                        persona: handle.clone(),
                        content: String::new(),
                        status: AgentStatus::Errored {
                            reason: format!("executor task failed: {e}"),
                        },
                        tool_calls: 0,
                    };
                    sink.emit(StreamEvent::AgentEnd {
                        persona: handle.clone(),
                        content: String::new(),
                        status: outcome.status.clone(),
                    });
                    outcome
                }
            };
            let message = self.record(&outcome).await;
            outcomes.push((outcome, message));
        }
        outcomes
    }

    /// 追加角色的回复；没有任何输出时不追加
    async fn record(&self, outcome: &AgentOutcome) -> Option<Message> {
        if outcome.content.trim().is_empty() {
            return None;
        }
        let mut message = Message::assistant(&outcome.persona, &outcome.content);
        if !outcome.status.is_completed() {
            message = message.mark_partial();
        }
        self.append(message.clone()).await;
        Some(message)
    }

    async fn append(&self, message: Message) {
        if let Err(e) = self.services.messages.append(&self.session_id, message).await {
            error!(session = %self.session_id, error = %e, "failed to append message");
        }
    }

    /// 重新读取名册；失败或结构非法时沿用上一份
    async fn refresh_roster(&mut self) {
        match self.services.personas.load_roster(&self.session_id).await {
            Ok(roster) => match roster.validate_structure() {
                Ok(()) => self.roster = Arc::new(roster),
                Err(reason) => {
                    warn!(session = %self.session_id, reason = %reason, "invalid roster, keeping previous")
                }
            },
            Err(e) => warn!(session = %self.session_id, error = %e, "roster reload failed, keeping previous"),
        }
    }

    /// Selected -> Speaking，并发布快照
    fn mark_speaking(&mut self, handle: &str) {
        let turn = self.turn_index;
        if let Some(p) = self.participant_mut(handle) {
            p.begin_speaking(turn);
        }
        self.publish_participants();
    }

    fn publish_participants(&self) {
        self.participant_view.send_replace(self.participants.clone());
    }

    fn participant_mut(&mut self, handle: &str) -> Option<&mut SessionParticipant> {
        self.participants.iter_mut().find(|p| p.handle == handle)
    }
}
