//! Concurrent update of several targets
//!
//! A supervisor task owns one task per target. Targets report statuses
//! through a shared bounded channel; the supervisor forwards them to the
//! caller and aborts every target on the first error.

use super::{download_progress, TargetLink, UpdateSettings, UpdateStatus, DOWNLOAD_START_PROGRESS};
use crate::bus::{MessageBus, NodeId, DATA_PAYLOAD_SIZE};
use crate::chunks::{Chunk, HexRecordProcessor};
use crate::error::UpdateError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

const STATUS_CHANNEL_CAPACITY: usize = 64;

type StatusItem = Result<(NodeId, UpdateStatus), UpdateError>;

/// Update every node in `targets` with its hex file, concurrently.
///
/// The run is lazy: nothing is sent until the first
/// [`UpdateStream::next`], which must be polled within a tokio runtime.
/// Statuses arrive on the returned stream as targets progress. A target that never enters its bootloader,
/// or whose erase is not acknowledged, stops reporting without reaching
/// done. Any other failure ends the whole run with that error.
pub fn run_updates(
    bus: Arc<dyn MessageBus>,
    targets: BTreeMap<NodeId, PathBuf>,
    settings: UpdateSettings,
) -> UpdateStream {
    let statuses = targets
        .keys()
        .map(|node| (*node, UpdateStatus::queued()))
        .collect();
    let (tx, rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
    UpdateStream {
        rx,
        pending: Some(PendingRun {
            bus,
            targets,
            settings,
            tx,
        }),
        supervisor: None,
        statuses,
    }
}

struct PendingRun {
    bus: Arc<dyn MessageBus>,
    targets: BTreeMap<NodeId, PathBuf>,
    settings: UpdateSettings,
    tx: mpsc::Sender<StatusItem>,
}

/// Statuses of a running update. Dropping the stream cancels the run.
pub struct UpdateStream {
    rx: mpsc::Receiver<StatusItem>,
    pending: Option<PendingRun>,
    supervisor: Option<JoinHandle<()>>,
    statuses: BTreeMap<NodeId, UpdateStatus>,
}

impl UpdateStream {
    /// Next status change, `None` once every target has finished or after
    /// an error has been returned
    pub async fn next(&mut self) -> Option<StatusItem> {
        if let Some(run) = self.pending.take() {
            self.supervisor = Some(tokio::spawn(supervise(
                run.bus,
                run.targets,
                run.settings,
                run.tx,
            )));
        }
        let item = self.rx.recv().await?;
        if let Ok((node, status)) = &item {
            self.statuses.insert(*node, *status);
        }
        Some(item)
    }

    /// Latest status of a target
    pub fn status(&self, node: NodeId) -> Option<UpdateStatus> {
        self.statuses.get(&node).copied()
    }

    /// Latest status of every target, `queued` until it first reports
    pub fn statuses(&self) -> &BTreeMap<NodeId, UpdateStatus> {
        &self.statuses
    }

    /// Drain the stream, returning every status received or the first error
    pub async fn collect(mut self) -> Result<Vec<(NodeId, UpdateStatus)>, UpdateError> {
        let mut all = Vec::new();
        while let Some(item) = self.next().await {
            all.push(item?);
        }
        Ok(all)
    }
}

impl Drop for UpdateStream {
    fn drop(&mut self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.abort();
        }
    }
}

async fn supervise(
    bus: Arc<dyn MessageBus>,
    targets: BTreeMap<NodeId, PathBuf>,
    settings: UpdateSettings,
    out: mpsc::Sender<StatusItem>,
) {
    let (task_tx, mut task_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
    let mut tasks = JoinSet::new();
    for (node, path) in targets {
        tasks.spawn(update_target(
            bus.clone(),
            node,
            path,
            settings.clone(),
            task_tx.clone(),
        ));
    }
    drop(task_tx);

    loop {
        tokio::select! {
            item = task_rx.recv() => match item {
                Some(Ok(status)) => {
                    if out.send(Ok(status)).await.is_err() {
                        tasks.abort_all();
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::error!("Firmware update failed: {}", e);
                    tasks.abort_all();
                    let _ = out.send(Err(e)).await;
                    return;
                }
                None => return,
            },
            Some(joined) = tasks.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tasks.abort_all();
                        let _ = out.send(Err(UpdateError::Task(e.to_string()))).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn update_target(
    bus: Arc<dyn MessageBus>,
    node: NodeId,
    path: PathBuf,
    settings: UpdateSettings,
    tx: mpsc::Sender<StatusItem>,
) {
    if let Err(e) = run_target(bus, node, path, &settings, &tx).await {
        let _ = tx.send(Err(e)).await;
    }
}

async fn emit(tx: &mpsc::Sender<StatusItem>, node: NodeId, status: UpdateStatus) {
    // A closed channel means the run was cancelled
    let _ = tx.send(Ok((node, status))).await;
}

async fn load_image(path: PathBuf) -> Result<Vec<Chunk>, UpdateError> {
    if !path.is_file() {
        return Err(UpdateError::FileNotFound { path });
    }
    let chunks = tokio::task::spawn_blocking(move || HexRecordProcessor::load(&path, DATA_PAYLOAD_SIZE))
        .await
        .map_err(|e| UpdateError::Task(e.to_string()))??;
    Ok(chunks)
}

async fn run_target(
    bus: Arc<dyn MessageBus>,
    node: NodeId,
    path: PathBuf,
    settings: &UpdateSettings,
    tx: &mpsc::Sender<StatusItem>,
) -> Result<(), UpdateError> {
    emit(tx, node, UpdateStatus::updating(0.0)).await;

    let mut link = TargetLink::new(bus, node)?;
    let chunks = load_image(path).await?;

    if let Err(e) = link.initiate(settings.retry_count, settings.timeout).await {
        tracing::warn!("{} did not enter its bootloader: {}", node, e);
        return Ok(());
    }
    if settings.erase {
        if let Err(e) = link.erase(settings.timeout).await {
            tracing::warn!("Could not erase {}: {}", node, e);
            return Ok(());
        }
    }
    emit(tx, node, UpdateStatus::updating(DOWNLOAD_START_PROGRESS)).await;

    let total = chunks.len();
    for (sent, chunk) in chunks.iter().enumerate() {
        link.send_chunk(chunk, settings.ack_wait).await?;
        emit(tx, node, UpdateStatus::updating(download_progress(sent + 1, total))).await;
    }

    let num_messages = u32::try_from(total).unwrap_or(u32::MAX);
    link.complete(num_messages, settings.ack_wait).await?;
    link.start_app().await?;

    tracing::info!("Firmware update on {} complete ({} chunks)", node, total);
    emit(tx, node, UpdateStatus::done()).await;
    Ok(())
}
