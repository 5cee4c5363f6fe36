//! Lifecycle tracker
//!
//! A single actor task owns every request record. Callers talk to it through
//! [`LifecycleTracker`], a cheap cloneable handle that sends commands over a
//! channel and awaits the reply, so status changes are serialized without
//! shared locks.
//!
//! Every accepted transition is checked against
//! [`DownloadStatus::allowed_transitions`] and broadcast as an [`Event`].
//! Completing a request schedules its expiry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{DownloadError, Error, Result};
use crate::types::{
    ArchiveResult, CompressionLevel, DownloadInfo, DownloadRequest, DownloadStatus, Event,
    RequestId, StatusChange,
};

const COMMAND_BUFFER: usize = 256;

/// Handle to the lifecycle tracker actor
#[derive(Clone, Debug)]
pub struct LifecycleTracker {
    tx: mpsc::Sender<Command>,
}

#[derive(Debug)]
enum Command {
    Register {
        request: DownloadRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    Transition {
        id: RequestId,
        to: DownloadStatus,
        outcome: Outcome,
        reply: oneshot::Sender<Result<DownloadStatus>>,
    },
    Expire {
        id: RequestId,
    },
    Get {
        id: RequestId,
        reply: oneshot::Sender<Option<DownloadInfo>>,
    },
    List {
        reply: oneshot::Sender<Vec<DownloadInfo>>,
    },
    Purge {
        older_than: Duration,
        reply: oneshot::Sender<Vec<RequestId>>,
    },
}

#[derive(Debug)]
enum Outcome {
    None,
    Failed(DownloadError),
    Completed(ArchiveResult),
}

#[derive(Debug)]
struct Record {
    archive_name: String,
    file_count: usize,
    total_bytes: u64,
    compression_level: CompressionLevel,
    created_at: DateTime<Utc>,
    status: DownloadStatus,
    updated_at: DateTime<Utc>,
    touched: Instant,
    completed_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    error: Option<DownloadError>,
    result: Option<ArchiveResult>,
    history: Vec<StatusChange>,
}

impl Record {
    fn new(request: &DownloadRequest) -> Self {
        Self {
            archive_name: request.archive_name.clone(),
            file_count: request.blobs.len(),
            total_bytes: request.total_size(),
            compression_level: request.compression_level,
            created_at: request.created_at,
            status: DownloadStatus::Pending,
            updated_at: request.created_at,
            touched: Instant::now(),
            completed_at: None,
            expires_at: None,
            error: None,
            result: None,
            history: vec![StatusChange {
                status: DownloadStatus::Pending,
                at: request.created_at,
            }],
        }
    }

    fn info(&self, id: RequestId) -> DownloadInfo {
        DownloadInfo {
            id,
            archive_name: self.archive_name.clone(),
            status: self.status,
            file_count: self.file_count,
            total_bytes: self.total_bytes,
            compression_level: self.compression_level,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            expires_at: self.expires_at,
            error: self.error.clone(),
            result: self.result.clone(),
            history: self.history.clone(),
        }
    }
}

impl LifecycleTracker {
    /// Spawn the tracker actor
    ///
    /// Completed requests move to `expired` after `zip_expiry`. The actor stops
    /// once every handle has been dropped.
    pub fn spawn(event_tx: broadcast::Sender<Event>, zip_expiry: Duration) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = Actor {
            records: HashMap::new(),
            event_tx,
            zip_expiry,
            expiry_tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Record a new request in `pending`
    pub async fn register(&self, request: DownloadRequest) -> Result<()> {
        self.call(|reply| Command::Register { request, reply })
            .await?
    }

    /// Move a request to `to`, returning the status it left
    pub async fn transition(&self, id: RequestId, to: DownloadStatus) -> Result<DownloadStatus> {
        self.call(|reply| Command::Transition {
            id,
            to,
            outcome: Outcome::None,
            reply,
        })
        .await?
    }

    /// Move a request to `failed`, recording the error
    pub async fn fail(&self, id: RequestId, error: DownloadError) -> Result<DownloadStatus> {
        self.call(|reply| Command::Transition {
            id,
            to: DownloadStatus::Failed,
            outcome: Outcome::Failed(error),
            reply,
        })
        .await?
    }

    /// Move a request to `completed`, recording the archive and scheduling expiry
    pub async fn complete(&self, id: RequestId, result: ArchiveResult) -> Result<DownloadStatus> {
        self.call(|reply| Command::Transition {
            id,
            to: DownloadStatus::Completed,
            outcome: Outcome::Completed(result),
            reply,
        })
        .await?
    }

    /// Snapshot of one request
    pub async fn get(&self, id: RequestId) -> Result<Option<DownloadInfo>> {
        self.call(|reply| Command::Get { id, reply }).await
    }

    /// Current status of one request
    pub async fn status(&self, id: RequestId) -> Result<DownloadStatus> {
        self.get(id)
            .await?
            .map(|info| info.status)
            .ok_or(Error::NotFound(id))
    }

    /// Status history of one request, oldest first
    pub async fn history(&self, id: RequestId) -> Result<Vec<StatusChange>> {
        self.get(id)
            .await?
            .map(|info| info.history)
            .ok_or(Error::NotFound(id))
    }

    /// Snapshots of every tracked request, oldest first
    pub async fn list(&self) -> Result<Vec<DownloadInfo>> {
        self.call(|reply| Command::List { reply }).await
    }

    /// Drop records in terminal states untouched for at least `older_than`
    ///
    /// Returns the ids removed.
    pub async fn purge_terminal(&self, older_than: Duration) -> Result<Vec<RequestId>> {
        self.call(|reply| Command::Purge { older_than, reply })
            .await
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| tracker_stopped())?;
        rx.await.map_err(|_| tracker_stopped())
    }
}

fn tracker_stopped() -> Error {
    Error::Other("lifecycle tracker has stopped".to_string())
}

struct Actor {
    records: HashMap<RequestId, Record>,
    event_tx: broadcast::Sender<Event>,
    zip_expiry: Duration,
    expiry_tx: mpsc::WeakSender<Command>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        tracing::debug!("Lifecycle tracker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { request, reply } => {
                let _ = reply.send(self.register(request));
            }
            Command::Transition {
                id,
                to,
                outcome,
                reply,
            } => {
                let _ = reply.send(self.apply(id, to, outcome));
            }
            Command::Expire { id } => {
                // A purge may already have removed the record
                if self.records.contains_key(&id)
                    && let Err(e) = self.apply(id, DownloadStatus::Expired, Outcome::None)
                {
                    tracing::debug!(request_id = %id, error = %e, "Expiry skipped");
                }
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.records.get(&id).map(|r| r.info(id)));
            }
            Command::List { reply } => {
                let mut all: Vec<_> = self.records.iter().map(|(id, r)| r.info(*id)).collect();
                all.sort_by_key(|info| info.created_at);
                let _ = reply.send(all);
            }
            Command::Purge { older_than, reply } => {
                let _ = reply.send(self.purge(older_than));
            }
        }
    }

    fn register(&mut self, request: DownloadRequest) -> Result<()> {
        let id = request.id;
        if self.records.contains_key(&id) {
            return Err(Error::Other(format!("request {id} is already registered")));
        }

        self.records.insert(id, Record::new(&request));
        tracing::debug!(request_id = %id, files = request.blobs.len(), "Request registered");
        self.emit(Event::Submitted {
            id,
            archive_name: request.archive_name,
            file_count: request.blobs.len(),
        });
        Ok(())
    }

    fn apply(&mut self, id: RequestId, to: DownloadStatus, outcome: Outcome) -> Result<DownloadStatus> {
        let record = self.records.get_mut(&id).ok_or(Error::NotFound(id))?;
        let from = record.status;

        if !from.can_transition_to(to) {
            tracing::error!(
                request_id = %id,
                from = %from,
                to = %to,
                "Rejected illegal status transition"
            );
            return Err(Error::InvalidTransition { id, from, to });
        }

        let now = Utc::now();
        record.status = to;
        record.updated_at = now;
        record.touched = Instant::now();
        record.history.push(StatusChange { status: to, at: now });

        let mut follow_up = None;
        match (to, outcome) {
            (DownloadStatus::Failed, Outcome::Failed(error)) => {
                record.error = Some(error.clone());
                follow_up = Some(Event::Failed { id, error });
            }
            (DownloadStatus::Failed, _) => {
                let error = DownloadError::new(
                    crate::error::DownloadErrorKind::Unknown,
                    "request failed without a recorded error",
                );
                record.error = Some(error.clone());
                follow_up = Some(Event::Failed { id, error });
            }
            (DownloadStatus::Completed, outcome) => {
                let expires_at = now
                    + chrono::Duration::from_std(self.zip_expiry)
                        .unwrap_or_else(|_| chrono::Duration::days(365));
                record.completed_at = Some(now);
                record.expires_at = Some(expires_at);
                if let Outcome::Completed(result) = outcome {
                    follow_up = Some(Event::Completed {
                        id,
                        url: result.url.clone(),
                        expires_at: result.expires_at,
                    });
                    record.result = Some(result);
                }
                self.schedule_expiry(id);
            }
            (DownloadStatus::Cancelled, _) => {
                follow_up = Some(Event::Cancelled { id });
            }
            (DownloadStatus::Expired, _) => {
                let destination = record
                    .result
                    .as_ref()
                    .map(|r| r.destination.clone())
                    .unwrap_or_default();
                follow_up = Some(Event::Expired { id, destination });
            }
            _ => {}
        }

        tracing::info!(request_id = %id, from = %from, to = %to, "Status changed");
        self.emit(Event::StatusChanged { id, from, to });
        if let Some(event) = follow_up {
            self.emit(event);
        }
        Ok(from)
    }

    fn schedule_expiry(&self, id: RequestId) {
        let expiry_tx = self.expiry_tx.clone();
        let delay = self.zip_expiry;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = expiry_tx.upgrade() {
                let _ = tx.send(Command::Expire { id }).await;
            }
        });
    }

    fn purge(&mut self, older_than: Duration) -> Vec<RequestId> {
        let now = Instant::now();
        let stale: Vec<RequestId> = self
            .records
            .iter()
            .filter(|(_, r)| r.status.is_terminal() && now.duration_since(r.touched) >= older_than)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.records.remove(id);
        }
        if !stale.is_empty() {
            tracing::info!(purged = stale.len(), "Purged finished request records");
        }
        stale
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }
}
