//! Orchestrator
//!
//! Runs the lifecycle of each query:
//! `Normalizing → Dispatching → Streaming → Finalizing → {Completed, Cancelled, Failed}`.
//!
//! A conversation has at most one active task. Submissions serialize on a
//! per-conversation lock; a new query cancels the active task and waits for
//! it to finalize before its own task starts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fista_common::config::OrchestratorConfig;
use fista_common::errors::{AppError, Result};
use fista_common::metrics;
use fista_common::models::{
    Completion, ConversationId, FeedbackEvent, FeedbackKind, Message, MessageId, Role,
    StreamUpdate, TaskState, TruncationReason,
};
use fista_common::QueryNormalizer;
use fista_search::aggregation::{AggregationEngine, AggregationOutcome, AggregationStatus, ResultView};
use futures::stream::{self, Stream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::store::{ActivityGuard, ConversationStore};

/// Content of a completed turn when no backend returned anything
pub const NO_RESULTS: &str = "No results found.";

/// Incremental output of one submitted query
pub struct QueryStream {
    message_id: MessageId,
    updates: mpsc::UnboundedReceiver<StreamUpdate>,
}

impl QueryStream {
    /// The agent message this query streams into
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Next update; `None` after the final (`done`) update
    pub async fn recv(&mut self) -> Option<StreamUpdate> {
        self.updates.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamUpdate> + Send + 'static {
        stream::unfold(self.updates, |mut updates| async move {
            updates.recv().await.map(|update| (update, updates))
        })
    }
}

struct ActiveTask {
    message_id: MessageId,
    cancel: CancellationToken,
    state: watch::Receiver<TaskState>,
}

impl ActiveTask {
    fn current(&self) -> TaskState {
        *self.state.borrow()
    }

    async fn cancel_and_wait(&self) {
        self.cancel.cancel();
        let mut state = self.state.clone();
        // Err means the task is gone, which is terminal too
        let _ = state.wait_for(|s| s.is_terminal()).await;
    }
}

type Slot = Arc<Mutex<Option<ActiveTask>>>;

pub struct Orchestrator {
    store: Arc<ConversationStore>,
    engine: Arc<AggregationEngine>,
    normalizer: QueryNormalizer,
    task_timeout: Duration,
    delta_buffer: usize,
    slots: DashMap<ConversationId, Slot>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        engine: Arc<AggregationEngine>,
        normalizer: QueryNormalizer,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            engine,
            normalizer,
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            delta_buffer: config.delta_buffer.max(1),
            slots: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    fn slot(&self, id: &ConversationId) -> Slot {
        self.slots.entry(id.clone()).or_default().clone()
    }

    /// Submit a query to a conversation.
    ///
    /// Rejected input returns the validation error without touching history.
    /// Otherwise the user message and an agent placeholder are appended and
    /// the returned stream carries every update of the placeholder.
    pub async fn submit_query(&self, conversation: &ConversationId, raw: &str) -> Result<QueryStream> {
        let text = match self.normalizer.normalize(raw) {
            Ok(text) => text,
            Err(e) => {
                let reason = match &e {
                    AppError::EmptyQuery => "empty",
                    AppError::QueryTooLong { .. } => "too_long",
                    _ => "invalid",
                };
                metrics::record_rejected(reason);
                warn!(conversation_id = %conversation, reason, "Query rejected");
                return Err(e);
            }
        };

        let slot = self.slot(conversation);
        let mut active = slot.lock().await;

        // The previous task stays in the slot until it is terminal
        if let Some(previous) = active.as_ref() {
            if !previous.current().is_terminal() {
                info!(
                    conversation_id = %conversation,
                    message_id = %previous.message_id,
                    "Superseding active query"
                );
                previous.cancel_and_wait().await;
            }
        }

        let backends = self.engine.pool().enabled_names().await;
        let guard = self.store.pin(conversation);
        self.store.append(conversation, Message::user(text.clone()));
        let placeholder = self.store.append(conversation, Message::placeholder());

        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(TaskState::Dispatching);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let task = QueryTask {
            store: self.store.clone(),
            engine: self.engine.clone(),
            conversation: conversation.clone(),
            message_id: placeholder.id,
            text,
            backends,
            cancel: cancel.clone(),
            state: state_tx,
            updates: updates_tx,
            timeout: self.task_timeout,
            delta_buffer: self.delta_buffer,
            revision: 0,
            _guard: guard,
        };

        info!(
            conversation_id = %conversation,
            message_id = %placeholder.id,
            "Query task started"
        );
        tokio::spawn(task.run());

        *active = Some(ActiveTask {
            message_id: placeholder.id,
            cancel,
            state: state_rx,
        });

        Ok(QueryStream {
            message_id: placeholder.id,
            updates: updates_rx,
        })
    }

    /// Cancel the active task, returning once it has finalized.
    ///
    /// Returns false when no task was active.
    pub async fn cancel(&self, conversation: &ConversationId) -> bool {
        let Some(slot) = self.slots.get(conversation).map(|s| s.clone()) else {
            return false;
        };
        let active = slot.lock().await;

        match active.as_ref() {
            Some(task) if !task.current().is_terminal() => {
                info!(conversation_id = %conversation, message_id = %task.message_id, "Cancelling query");
                task.cancel_and_wait().await;
                true
            }
            _ => false,
        }
    }

    /// State of the active task, `Idle` when none is running
    pub async fn status(&self, conversation: &ConversationId) -> TaskState {
        let Some(slot) = self.slots.get(conversation).map(|s| s.clone()) else {
            return TaskState::Idle;
        };
        let active = slot.lock().await;

        match active.as_ref().map(ActiveTask::current) {
            Some(state) if !state.is_terminal() => state,
            _ => TaskState::Idle,
        }
    }

    /// Re-run the user query that preceded an agent message, as a new turn
    pub async fn regenerate(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> Result<QueryStream> {
        let messages = self.store.get(conversation)?;
        let position = messages
            .iter()
            .position(|m| m.id == *message_id)
            .ok_or_else(|| AppError::MessageNotFound {
                id: message_id.to_string(),
            })?;

        if messages[position].role != Role::Agent {
            return Err(AppError::Validation {
                message: "only agent messages can be regenerated".to_string(),
                field: Some("message_id".to_string()),
            });
        }

        let query = messages[..position]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .ok_or_else(|| AppError::Validation {
                message: "no user query precedes this message".to_string(),
                field: Some("message_id".to_string()),
            })?;

        info!(conversation_id = %conversation, message_id = %message_id, "Regenerating response");
        self.submit_query(conversation, &query).await
    }

    /// Record a reaction to a message; history is left untouched
    pub fn feedback(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
        kind: FeedbackKind,
    ) -> Result<FeedbackEvent> {
        let message = self.store.message(conversation, message_id)?;

        if kind != FeedbackKind::Copy && message.role != Role::Agent {
            return Err(AppError::Validation {
                message: format!("{} applies to agent messages only", kind.as_str()),
                field: Some("kind".to_string()),
            });
        }

        info!(
            conversation_id = %conversation,
            message_id = %message_id,
            kind = kind.as_str(),
            "Feedback recorded"
        );
        metrics::record_feedback(kind.as_str());

        Ok(FeedbackEvent {
            conversation_id: conversation.clone(),
            message_id: *message_id,
            kind,
            content: message.content,
            recorded_at: Utc::now(),
        })
    }

    /// Evict idle conversations from the store and drop their task slots
    pub fn evict(&self) -> usize {
        self.evict_at(Utc::now())
    }

    pub fn evict_at(&self, now: DateTime<Utc>) -> usize {
        let evicted = self.store.evict_at(now);
        let pruned = self.prune_slots();
        if pruned > 0 {
            debug!(pruned, remaining = self.slots.len(), "Task slots pruned");
        }
        evicted
    }

    /// Number of conversations with a task slot
    pub fn tracked_conversations(&self) -> usize {
        self.slots.len()
    }

    /// Remove idle slots of conversations that are no longer stored.
    ///
    /// A slot is idle when nobody else holds it and its task, if any, is
    /// terminal. Cloning a slot happens under the map entry, so a submit that
    /// already grabbed the slot keeps it alive.
    fn prune_slots(&self) -> usize {
        let candidates: Vec<ConversationId> = self
            .slots
            .iter()
            .filter(|entry| !self.store.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut pruned = 0;
        for id in candidates {
            let removed = self.slots.remove_if(&id, |id, slot| {
                Arc::strong_count(slot) == 1
                    && !self.store.contains(id)
                    && slot.try_lock().is_ok_and(|active| {
                        active.as_ref().map_or(true, |task| task.current().is_terminal())
                    })
            });
            if removed.is_some() {
                pruned += 1;
            }
        }
        pruned
    }

    /// Run `evict` every `interval` until `shutdown` is cancelled
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Conversation sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.evict();
                    }
                }
            }
        })
    }

    /// Cancel every active task and wait for each to finalize
    pub async fn shutdown(&self) {
        let slots: Vec<(ConversationId, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut cancelled = 0;
        for (conversation, slot) in slots {
            let active = slot.lock().await;
            if let Some(task) = active.as_ref() {
                if !task.current().is_terminal() {
                    debug!(conversation_id = %conversation, "Cancelling query for shutdown");
                    task.cancel_and_wait().await;
                    cancelled += 1;
                }
            }
        }

        info!(cancelled, "Orchestrator shut down");
    }
}

/// One query in flight; owns the placeholder until it is finalized
struct QueryTask {
    store: Arc<ConversationStore>,
    engine: Arc<AggregationEngine>,
    conversation: ConversationId,
    message_id: MessageId,
    text: String,
    backends: Vec<String>,
    cancel: CancellationToken,
    state: watch::Sender<TaskState>,
    updates: mpsc::UnboundedSender<StreamUpdate>,
    timeout: Duration,
    delta_buffer: usize,
    revision: u64,
    _guard: ActivityGuard,
}

enum Ending {
    Finished,
    Cancelled,
    TimedOut,
}

impl QueryTask {
    async fn run(mut self) {
        let started = Instant::now();
        metrics::record_active_tasks(1.0);

        let engine_cancel = self.cancel.child_token();
        let (delta_tx, mut deltas) = mpsc::channel(self.delta_buffer);
        let aggregation = {
            let engine = self.engine.clone();
            let text = self.text.clone();
            let backends = self.backends.clone();
            let cancel = engine_cancel.clone();
            tokio::spawn(async move { engine.run(&text, &backends, cancel, delta_tx).await })
        };

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut view = ResultView::new();
        let mut ending = Ending::Finished;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    ending = Ending::Cancelled;
                    break;
                }
                _ = &mut deadline => {
                    warn!(
                        conversation_id = %self.conversation,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Query timed out"
                    );
                    engine_cancel.cancel();
                    ending = Ending::TimedOut;
                    break;
                }
                delta = deltas.recv() => {
                    let Some(delta) = delta else { break };
                    if self.cancel.is_cancelled() {
                        ending = Ending::Cancelled;
                        break;
                    }

                    view.apply(&delta);
                    let content = view.render();
                    if let Err(e) = self.store.update_partial(&self.conversation, &self.message_id, content.clone()) {
                        error!(conversation_id = %self.conversation, error = %e, "Failed to update partial message");
                    }

                    self.state.send_replace(TaskState::Streaming);
                    self.emit(content, TaskState::Streaming, None, Vec::new());
                }
            }
        }

        // Nothing more reaches the placeholder once streaming stops
        drop(deltas);
        self.state.send_replace(TaskState::Finalizing);

        let outcome = aggregation.await;
        if matches!(ending, Ending::Finished) && self.cancel.is_cancelled() {
            ending = Ending::Cancelled;
        }

        let (content, completion, final_state, label, degraded) = match outcome {
            Err(e) => {
                error!(conversation_id = %self.conversation, error = %e, "Aggregation task failed");
                let failure = AppError::AllBackendsFailed {
                    message: format!("aggregation task failed: {}", e),
                };
                (
                    failure.to_string(),
                    Completion::Failed,
                    TaskState::Failed,
                    "failed",
                    Vec::new(),
                )
            }
            Ok(outcome) => self.conclude(ending, outcome, &view),
        };

        if let Err(e) = self.store.finalize(
            &self.conversation,
            &self.message_id,
            content.clone(),
            completion,
            degraded.clone(),
        ) {
            error!(conversation_id = %self.conversation, error = %e, "Failed to finalize message");
        }

        self.emit(content, final_state, Some(completion), degraded);
        self.state.send_replace(final_state);

        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_query(label, elapsed);
        metrics::record_active_tasks(-1.0);

        info!(
            conversation_id = %self.conversation,
            message_id = %self.message_id,
            outcome = label,
            revisions = self.revision,
            duration_ms = (elapsed * 1000.0) as u64,
            "Query task finished"
        );
    }

    fn conclude(
        &self,
        ending: Ending,
        outcome: AggregationOutcome,
        view: &ResultView,
    ) -> (String, Completion, TaskState, &'static str, Vec<String>) {
        let degraded = outcome.degraded_sources();

        match ending {
            Ending::Cancelled => (
                view.render(),
                Completion::Truncated {
                    reason: TruncationReason::Cancelled,
                },
                TaskState::Cancelled,
                "cancelled",
                degraded,
            ),
            Ending::TimedOut => (
                view.render(),
                Completion::Truncated {
                    reason: TruncationReason::Timeout,
                },
                TaskState::Cancelled,
                "timeout",
                degraded,
            ),
            Ending::Finished => match outcome.status {
                AggregationStatus::Completed => {
                    let content = if outcome.content.is_empty() {
                        NO_RESULTS.to_string()
                    } else {
                        outcome.content
                    };
                    (content, Completion::Complete, TaskState::Completed, "completed", degraded)
                }
                AggregationStatus::AllBackendsFailed => {
                    let failure = AppError::AllBackendsFailed {
                        message: outcome.failure_reason(),
                    };
                    warn!(conversation_id = %self.conversation, error = %failure, "All backends failed");
                    (
                        failure.to_string(),
                        Completion::Failed,
                        TaskState::Failed,
                        "failed",
                        degraded,
                    )
                }
                AggregationStatus::Cancelled => (
                    view.render(),
                    Completion::Truncated {
                        reason: TruncationReason::Cancelled,
                    },
                    TaskState::Cancelled,
                    "cancelled",
                    degraded,
                ),
            },
        }
    }

    fn emit(
        &mut self,
        content: String,
        state: TaskState,
        completion: Option<Completion>,
        degraded_sources: Vec<String>,
    ) {
        self.revision += 1;
        let update = StreamUpdate {
            conversation_id: self.conversation.clone(),
            message_id: self.message_id,
            revision: self.revision,
            content,
            done: completion.is_some(),
            state,
            completion,
            degraded_sources,
        };
        // The client may have stopped listening; the task still finalizes
        let _ = self.updates.send(update);
    }
}
