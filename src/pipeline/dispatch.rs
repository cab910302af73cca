use log::{ error, info, warn };
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{ Hash, Hasher };
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{ mpsc, oneshot };

use super::orchestrator::{ Orchestrator, PipelineOutcome };
use crate::models::chat::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Run the pipeline on the caller's task.
    Inline,
    /// Hand off to a worker pool, sharded by conversation.
    Background,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inline" => Ok(DispatchMode::Inline),
            "background" => Ok(DispatchMode::Background),
            other => Err(format!("Invalid dispatch mode: '{}'", other)),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Inline => write!(f, "inline"),
            DispatchMode::Background => write!(f, "background"),
        }
    }
}

/// Completion handle for a submitted message.
#[derive(Debug)]
pub struct PipelineTicket {
    message_id: MessageId,
    rx: oneshot::Receiver<PipelineOutcome>,
}

impl PipelineTicket {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Waits for the run to finish. A worker that went away reports `error`.
    pub async fn outcome(self) -> PipelineOutcome {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => PipelineOutcome::error(self.message_id, "pipeline worker dropped the job"),
        }
    }
}

struct Job {
    message_id: MessageId,
    reply: oneshot::Sender<PipelineOutcome>,
}

/// Submits accepted messages to the orchestrator. In background mode all
/// messages of one conversation land on the same worker, so their replies
/// are produced in submission order.
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    mode: DispatchMode,
    shards: Vec<mpsc::Sender<Job>>,
}

impl Dispatcher {
    pub fn inline(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator, mode: DispatchMode::Inline, shards: Vec::new() }
    }

    /// Spawns `workers` tasks; must be called inside a Tokio runtime.
    pub fn background(orchestrator: Arc<Orchestrator>, workers: usize, queue: usize) -> Self {
        let workers = workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::channel(queue.max(1));
            tokio::spawn(run_worker(worker, Arc::clone(&orchestrator), rx));
            shards.push(tx);
        }
        info!("Started {} pipeline worker(s)", workers);
        Self { orchestrator, mode: DispatchMode::Background, shards }
    }

    pub fn new(orchestrator: Arc<Orchestrator>, mode: DispatchMode, workers: usize, queue: usize) -> Self {
        match mode {
            DispatchMode::Inline => Self::inline(orchestrator),
            DispatchMode::Background => Self::background(orchestrator, workers, queue),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub async fn submit(&self, conversation_id: &str, message_id: MessageId) -> PipelineTicket {
        let (tx, rx) = oneshot::channel();
        let ticket = PipelineTicket { message_id, rx };

        if self.shards.is_empty() {
            let outcome = self.orchestrator.handle_user_message(message_id).await;
            let _ = tx.send(outcome);
            return ticket;
        }

        let shard = shard_for(conversation_id, self.shards.len());
        if let Err(mpsc::error::SendError(job)) = self.shards[shard].send(Job {
            message_id,
            reply: tx,
        }).await {
            warn!("Pipeline worker {} is gone, running {} inline", shard, message_id);
            let outcome = self.orchestrator.handle_user_message(job.message_id).await;
            let _ = job.reply.send(outcome);
        }
        ticket
    }
}

async fn run_worker(worker: usize, orchestrator: Arc<Orchestrator>, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        let outcome = orchestrator.handle_user_message(job.message_id).await;
        // Nobody may be waiting; the outcome is already logged.
        let _ = job.reply.send(outcome);
    }
    error!("Pipeline worker {} stopped", worker);
}

fn shard_for(conversation_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    conversation_id.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("Inline".parse::<DispatchMode>(), Ok(DispatchMode::Inline));
        assert_eq!("background".parse::<DispatchMode>(), Ok(DispatchMode::Background));
        assert!("celery".parse::<DispatchMode>().is_err());
    }

    #[test]
    fn shard_is_stable_per_conversation() {
        for n in 1..8 {
            assert_eq!(shard_for("c1", n), shard_for("c1", n));
            assert!(shard_for("c1", n) < n);
        }
    }
}
