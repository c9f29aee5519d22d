//! Output sink
//!
//! Analyzers produce [`SinkPack`]s; jobs forward them over a bounded channel to a
//! worker that persists each pack into the dataset named by the pack. File packs are
//! written under the configured files directory, or stored inline when none is set.
//! Persistence failures are logged and the pack is dropped.

mod pack;

pub use pack::{FilePayload, SinkPack};

use crate::config::SinkConfig;
use crate::storage::{FieldValue, Record, StorageError, Store};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sending half handed to jobs
pub type SinkSender = mpsc::Sender<SinkPack>;

/// The sink channel and its persistence worker
pub struct Sink {
    tx: SinkSender,
    worker: JoinHandle<u64>,
}

impl Sink {
    /// Opens the sink and spawns its worker
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `store` - Store receiving the records
    /// * `config` - Channel capacity and files directory
    pub fn open(store: Arc<dyn Store>, config: &SinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let files_dir = config.files_dir.as_ref().map(PathBuf::from);
        let worker = tokio::spawn(run_worker(rx, store, files_dir));
        Self { tx, worker }
    }

    /// A sender for connecting a job
    pub fn sender(&self) -> SinkSender {
        self.tx.clone()
    }

    /// Closes the channel and waits until every queued pack has been persisted
    ///
    /// Packs still held by other senders are drained once those senders are dropped.
    ///
    /// # Returns
    ///
    /// The number of packs persisted
    pub async fn close(self) -> u64 {
        drop(self.tx);
        match self.worker.await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Sink worker failed: {}", e);
                0
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<SinkPack>,
    store: Arc<dyn Store>,
    files_dir: Option<PathBuf>,
) -> u64 {
    let mut datasets = HashSet::new();
    let mut persisted = 0;

    while let Some(pack) = rx.recv().await {
        match persist(store.as_ref(), files_dir.as_deref(), &mut datasets, &pack).await {
            Ok(()) => persisted += 1,
            Err(e) => tracing::error!("Dropping record {} for {}: {}", pack.id, pack.name, e),
        }
    }

    tracing::debug!("Sink closed after persisting {} records", persisted);
    persisted
}

async fn persist(
    store: &dyn Store,
    files_dir: Option<&Path>,
    datasets: &mut HashSet<String>,
    pack: &SinkPack,
) -> Result<(), StorageError> {
    if !datasets.contains(&pack.name) {
        store.create_dataset(&pack.name)?;
        datasets.insert(pack.name.clone());
    }

    let data =
        serde_json::to_string(&pack.data).map_err(|e| StorageError::Serialization(e.to_string()))?;

    let mut record = Record::new();
    record.insert("record_id".to_string(), FieldValue::from(pack.id.as_str()));
    record.insert("url".to_string(), FieldValue::from(pack.url.as_str()));
    record.insert("hash".to_string(), FieldValue::from(pack.hash.as_str()));
    record.insert("data".to_string(), FieldValue::from(data));

    if let Some(file) = &pack.file {
        match files_dir {
            Some(dir) => {
                let path = write_file(dir, pack, file).await?;
                record.insert(
                    "file_path".to_string(),
                    FieldValue::from(path.to_string_lossy().into_owned()),
                );
            }
            None => {
                record.insert("file".to_string(), FieldValue::from(file.bytes.clone()));
            }
        }
    }

    store.insert_object(&pack.name, &record)?;
    tracing::trace!("Stored record {} in {}", pack.id, pack.name);
    Ok(())
}

async fn write_file(dir: &Path, pack: &SinkPack, file: &FilePayload) -> std::io::Result<PathBuf> {
    let folder = dir.join(&pack.name);
    tokio::fs::create_dir_all(&folder).await?;

    let path = folder.join(format!("{}{}", pack.hash, file.ext));
    tokio::fs::write(&path, &file.bytes).await?;
    Ok(path)
}
