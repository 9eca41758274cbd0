//! Ordered background writer
//!
//! A store is moved onto a dedicated worker thread and driven through a
//! channel. Sensor processing only enqueues commands, so it never waits on a
//! network or disk round-trip. Commands run strictly in submission order.

use log::{error, warn};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

use super::{StepStore, StoreWrite, StoredSnapshot};
use crate::error::StoreError;
use crate::types::UserKey;

type StoreTask = Box<dyn FnOnce(&mut dyn StepStore) + Send + 'static>;

/// Receiver side of a pending load
pub type PendingLoad = oneshot::Receiver<Result<StoredSnapshot, StoreError>>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct HandleInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Shutdown is queued behind any outstanding writes, which still run
        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store worker: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store worker: {join_err:?}");
            }
        }
    }
}

/// Cloneable handle to a store running on its own worker thread
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<HandleInner>,
}

impl StoreHandle {
    /// Move `store` onto a new worker thread
    pub fn spawn<S: StepStore>(store: S) -> Result<Self, StoreError> {
        let (sender, receiver) = mpsc::channel::<StoreCommand>();

        let worker = thread::Builder::new()
            .name("stepflux-store".to_string())
            .spawn(move || {
                let mut store = store;
                while let Ok(command) = receiver.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut store as &mut dyn StepStore),
                        StoreCommand::Shutdown => break,
                    }
                }
            })?;

        Ok(Self {
            inner: Arc::new(HandleInner {
                sender,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    fn submit<F>(&self, task: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut dyn StepStore) + Send + 'static,
    {
        self.inner
            .sender
            .send(StoreCommand::Execute(Box::new(task)))
            .map_err(|_| StoreError::Closed)
    }

    /// Request a user's stored state for `date`.
    ///
    /// If the worker is gone the receiver resolves with a closed error.
    pub fn load(&self, user: UserKey, date: String) -> PendingLoad {
        let (tx, rx) = oneshot::channel();
        let submitted = self.submit(move |store| {
            let _ = tx.send(store.load(&user, &date));
        });
        if let Err(err) = submitted {
            warn!("Could not queue state load: {err}");
        }
        rx
    }

    /// Fire-and-forget write; failures are logged and dropped
    pub fn write(&self, user: &UserKey, write: StoreWrite) {
        let user = user.clone();
        let submitted = self.submit(move |store| {
            if let Err(err) = store.write(&user, &write) {
                warn!("Store write {} for {user} failed: {err}", write.path());
            }
        });
        if let Err(err) = submitted {
            warn!("Could not queue store write: {err}");
        }
    }

    /// Resolves once every previously queued command has run
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.submit(move |_| {
            let _ = tx.send(());
        })?;
        rx.await.map_err(|_| StoreError::Closed)
    }
}
