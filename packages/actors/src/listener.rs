//! Completion listener: correlates worker replies with dispatched jobs.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use broker::{ReplyDelivery, ReplySink};
use dispatch_core::{CorrelationId, JobDescriptor, ReplyMessage, TrackedJob};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::task::JoinHandle;

use crate::hooks::{ImportFailure, ModelStatus, ModelStatusHooks};
use crate::messages::ListenerMessage;

/// Finished jobs remembered by default, for duplicate-reply detection and lookups.
///
/// The same capacity bounds unfinished jobs first seen through a reply (jobs
/// dispatched by an earlier process); the oldest of those is evicted first.
/// A duplicate terminal reply arriving after its job left the history is
/// treated as a reply for an unknown job and runs the hooks again.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Arguments for spawning the listener.
pub struct ListenerArgs {
    pub hooks: Arc<dyn ModelStatusHooks>,
    /// Passed to [`ModelStatusHooks::import_success`].
    pub shared_storage: PathBuf,
    pub history_capacity: usize,
}

impl ListenerArgs {
    pub fn new(hooks: Arc<dyn ModelStatusHooks>, shared_storage: impl Into<PathBuf>) -> Self {
        Self {
            hooks,
            shared_storage: shared_storage.into(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}

/// State for the listener actor.
pub struct ListenerState {
    hooks: Arc<dyn ModelStatusHooks>,
    shared_storage: PathBuf,
    /// Jobs still waiting for a terminal reply.
    active: HashMap<CorrelationId, TrackedJob>,
    /// Untracked entries of `active`, oldest first.
    untracked_order: VecDeque<CorrelationId>,
    /// Last hook task per unfinished job; the next hook for that job waits on it.
    hook_chains: HashMap<CorrelationId, JoinHandle<()>>,
    /// Finished jobs, bounded; `retired_order` holds eviction order.
    retired: HashMap<CorrelationId, TrackedJob>,
    retired_order: VecDeque<CorrelationId>,
    history_capacity: usize,
}

impl ListenerState {
    fn new(args: ListenerArgs) -> Self {
        Self {
            hooks: args.hooks,
            shared_storage: args.shared_storage,
            active: HashMap::new(),
            untracked_order: VecDeque::new(),
            hook_chains: HashMap::new(),
            retired: HashMap::new(),
            retired_order: VecDeque::new(),
            history_capacity: args.history_capacity,
        }
    }

    fn track(&mut self, descriptor: JobDescriptor) {
        tracing::debug!(
            correlation_id = %descriptor.correlation_id,
            kind = descriptor.kind.as_str(),
            "Tracking job"
        );
        let id = descriptor.correlation_id.clone();
        self.active.insert(id, TrackedJob::dispatched(descriptor));
    }

    fn forget(&mut self, correlation_id: &CorrelationId) {
        self.active.remove(correlation_id);
        self.hook_chains.remove(correlation_id);
    }

    fn admit_untracked(&mut self, correlation_id: CorrelationId) {
        tracing::info!(%correlation_id, "Reply for a job not dispatched by this process");
        let capacity = self.history_capacity.max(1);
        while self.untracked_order.len() >= capacity {
            let Some(oldest) = self.untracked_order.pop_front() else {
                break;
            };
            if self.active.get(&oldest).is_some_and(|job| job.kind.is_none()) {
                tracing::warn!(correlation_id = %oldest, "Evicting unfinished untracked job");
                self.forget(&oldest);
            }
        }
        self.untracked_order.push_back(correlation_id.clone());
        self.active.insert(correlation_id.clone(), TrackedJob::untracked(correlation_id));
    }

    fn retire(&mut self, job: TrackedJob) {
        if self.history_capacity == 0 {
            return;
        }
        while self.retired_order.len() >= self.history_capacity {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired_order.push_back(job.correlation_id.clone());
        self.retired.insert(job.correlation_id.clone(), job);
    }

    /// Apply a reply to the job table. Returns the reply when hooks should run.
    fn on_reply(&mut self, delivery: ReplyDelivery) -> Option<(CorrelationId, ReplyMessage)> {
        let Some(raw_id) = delivery.correlation_id.as_deref() else {
            tracing::warn!("Dropping reply without correlation id");
            return None;
        };
        let correlation_id = match CorrelationId::parse(raw_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("Dropping reply: {}", e);
                return None;
            }
        };
        let reply = match ReplyMessage::from_slice(&delivery.body) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(
                    %correlation_id,
                    body = %String::from_utf8_lossy(&delivery.body),
                    "Malformed reply: {}",
                    e
                );
                return None;
            }
        };

        if let Some(done) = self.retired.get(&correlation_id) {
            tracing::warn!(
                %correlation_id,
                state = %done.state,
                "Ignoring reply for finished job"
            );
            return None;
        }

        if !self.active.contains_key(&correlation_id) {
            self.admit_untracked(correlation_id.clone());
        }
        let job = self.active.get_mut(&correlation_id)?;

        match job.apply(&reply) {
            Ok(state) => {
                tracing::info!(
                    %correlation_id,
                    database = reply.database(),
                    project = reply.project(),
                    "Job is now {}",
                    state
                );
                if state.is_terminal() {
                    if let Some(job) = self.active.remove(&correlation_id) {
                        if job.kind.is_none() {
                            self.untracked_order.retain(|id| id != &correlation_id);
                        }
                        self.retire(job);
                    }
                }
                Some((correlation_id, reply))
            }
            Err(e) => {
                tracing::warn!(%correlation_id, "Ignoring reply: {}", e);
                None
            }
        }
    }

    /// Hooks for one job run in reply order; different jobs do not wait on each other.
    fn run_hooks(&mut self, correlation_id: CorrelationId, reply: ReplyMessage) {
        let hooks = self.hooks.clone();
        let shared_storage = self.shared_storage.clone();
        let terminal = matches!(reply, ReplyMessage::Terminal(_));
        let previous = self.hook_chains.remove(&correlation_id);

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let (hook, result) = match reply {
                ReplyMessage::Processing { database, project } => (
                    "set_status",
                    hooks
                        .set_status(database, project, ModelStatus::Processing)
                        .await,
                ),
                ReplyMessage::Terminal(outcome) if outcome.is_success() => (
                    "import_success",
                    hooks
                        .import_success(outcome.database, outcome.project, shared_storage)
                        .await,
                ),
                ReplyMessage::Terminal(outcome) => (
                    "import_fail",
                    hooks
                        .import_fail(ImportFailure {
                            database: outcome.database,
                            project: outcome.project,
                            user: outcome.user,
                            code: outcome.code,
                            message: outcome.message,
                            report: true,
                        })
                        .await,
                ),
            };
            if let Err(e) = result {
                tracing::error!(hook, "Model status hook failed: {}", e);
            }
        });

        if !terminal {
            self.hook_chains.insert(correlation_id, task);
        }
    }

    fn find(&self, correlation_id: &CorrelationId) -> Option<TrackedJob> {
        self.active
            .get(correlation_id)
            .or_else(|| self.retired.get(correlation_id))
            .cloned()
    }

    fn list(&self, state_filter: Option<&str>, limit: usize) -> Vec<TrackedJob> {
        let mut jobs: Vec<TrackedJob> = self
            .active
            .values()
            .chain(self.retired.values())
            .filter(|job| state_filter.is_none_or(|s| job.state.as_str() == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.dispatched_at.cmp(&b.dispatched_at));
        jobs.truncate(limit);
        jobs
    }
}

/// Listener actor. Owns the job table; nothing else mutates it.
pub struct CompletionListener;

impl Actor for CompletionListener {
    type Msg = ListenerMessage;
    type State = ListenerState;
    type Arguments = ListenerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            history_capacity = args.history_capacity,
            "Starting completion listener"
        );
        Ok(ListenerState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ListenerMessage::Track(descriptor) => state.track(*descriptor),

            ListenerMessage::Forget(correlation_id) => state.forget(&correlation_id),

            ListenerMessage::Reply(delivery) => {
                if let Some((correlation_id, reply)) = state.on_reply(delivery) {
                    state.run_hooks(correlation_id, reply);
                }
            }

            ListenerMessage::GetJob {
                correlation_id,
                reply,
            } => {
                let _ = reply.send(state.find(&correlation_id));
            }

            ListenerMessage::ListJobs {
                state_filter,
                limit,
                reply,
            } => {
                let _ = reply.send(state.list(state_filter.as_deref(), limit));
            }

            ListenerMessage::Shutdown => {
                tracing::info!(
                    pending = state.active.len(),
                    "Shutting down completion listener"
                );
                myself.stop(None);
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("completion listener is not running")]
    NotRunning,

    #[error("completion listener dropped the request")]
    NoReply,
}

/// Cloneable handle to a running listener.
#[derive(Clone)]
pub struct ListenerHandle {
    actor: ActorRef<ListenerMessage>,
}

impl ListenerHandle {
    pub fn actor(&self) -> &ActorRef<ListenerMessage> {
        &self.actor
    }

    /// Register a job before it is published so an early reply still matches.
    pub fn track(&self, descriptor: JobDescriptor) -> Result<(), ListenerError> {
        self.actor
            .send_message(ListenerMessage::Track(Box::new(descriptor)))
            .map_err(|_| ListenerError::NotRunning)
    }

    /// Undo [`ListenerHandle::track`] for a job whose publish failed.
    pub fn forget(&self, correlation_id: CorrelationId) {
        let _ = self.actor.send_message(ListenerMessage::Forget(correlation_id));
    }

    pub async fn get_job(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<TrackedJob>, ListenerError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(ListenerMessage::GetJob {
                correlation_id,
                reply: tx.into(),
            })
            .map_err(|_| ListenerError::NotRunning)?;
        rx.await.map_err(|_| ListenerError::NoReply)
    }

    pub async fn list_jobs(
        &self,
        state_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TrackedJob>, ListenerError> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.actor
            .send_message(ListenerMessage::ListJobs {
                state_filter: state_filter.map(str::to_string),
                limit,
                reply: tx.into(),
            })
            .map_err(|_| ListenerError::NotRunning)?;
        rx.await.map_err(|_| ListenerError::NoReply)
    }

    pub fn shutdown(&self) {
        let _ = self.actor.send_message(ListenerMessage::Shutdown);
    }

    /// Reply sink feeding this listener, for [`broker::BrokerConnection::with_reply_sink`].
    pub fn sink(&self) -> Arc<dyn ReplySink> {
        Arc::new(ListenerSink {
            actor: self.actor.clone(),
        })
    }
}

/// Forwards broker replies into the listener's mailbox.
pub struct ListenerSink {
    actor: ActorRef<ListenerMessage>,
}

impl ReplySink for ListenerSink {
    fn deliver(&self, reply: ReplyDelivery) {
        if self.actor.send_message(ListenerMessage::Reply(reply)).is_err() {
            tracing::warn!("Completion listener is gone, dropping reply");
        }
    }
}

/// Start the listener.
pub async fn start_listener(
    args: ListenerArgs,
) -> Result<(ListenerHandle, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let (actor, handle) = Actor::spawn(None, CompletionListener, args).await?;
    Ok((ListenerHandle { actor }, handle))
}
