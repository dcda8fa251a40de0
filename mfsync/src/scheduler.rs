//! Transfer scheduler: turns available files into queued requests and
//! keeps a bounded pool of download sessions busy. Resolves its
//! completion signal once every explicitly requested name is stored.

use std::sync::Arc;
use std::time::Duration;

use mfsync_core::{AvailableFile, CryptoHandler, ProgressRegistry, RequestQueue, Store};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::transfer;

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Does `name` match a requested token, either exactly or as a file
/// below the token interpreted as a directory prefix?
fn matches_token(name: &str, token: &str) -> bool {
    name == token || name.strip_prefix(token).is_some_and(|rest| rest.starts_with('/'))
}

/// A token is satisfied once its file is stored, or, for a directory
/// prefix, once everything announced below it is stored.
fn token_satisfied(store: &Store, token: &str) -> bool {
    if store.is_name_stored(token) {
        return true;
    }
    let below: Vec<String> = store
        .get_available_files()
        .into_iter()
        .map(|available| available.file_info.file_name)
        .filter(|name| matches_token(name, token))
        .collect();
    let any_stored = store
        .get_stored_files()
        .iter()
        .any(|info| matches_token(&info.file_name, token));
    any_stored && below.iter().all(|name| store.is_name_stored(name))
}

pub struct Scheduler {
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    progress: Arc<ProgressRegistry>,
    queue: Arc<RequestQueue>,
    slots: Vec<Option<JoinHandle<()>>>,
    requested: Vec<String>,
    request_all: bool,
    tls: Option<TlsConnector>,
    done: watch::Sender<bool>,
}

impl Scheduler {
    /// An empty request list means "pull everything that appears".
    pub fn new(
        store: Arc<Store>,
        handler: Arc<CryptoHandler>,
        progress: Arc<ProgressRegistry>,
        max_concurrent: usize,
        requested: Vec<String>,
        tls: Option<TlsConnector>,
    ) -> (Self, watch::Receiver<bool>) {
        let (done, done_rx) = watch::channel(false);
        let request_all = requested.is_empty();
        let scheduler = Self {
            store,
            handler,
            progress,
            queue: Arc::new(RequestQueue::new()),
            slots: (0..max_concurrent.max(1)).map(|_| None).collect(),
            requested,
            request_all,
            tls,
            done,
        };
        (scheduler, done_rx)
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        loop {
            tick.tick().await;
            self.tick();
        }
    }

    fn tick(&mut self) {
        for available in self.store.get_available_files() {
            let name = &available.file_info.file_name;
            let wanted = self.request_all
                || self
                    .requested
                    .iter()
                    .any(|token| matches_token(name, token));
            if wanted {
                self.enqueue(available);
            }
        }

        if !self.request_all {
            let store = &self.store;
            self.requested.retain(|token| !token_satisfied(store, token));
            if self.requested.is_empty() {
                self.done.send_replace(true);
            }
        }

        for slot in &mut self.slots {
            let free = slot.as_ref().map_or(true, |handle| handle.is_finished());
            if free && !self.queue.is_empty() {
                *slot = Some(tokio::spawn(run_slot(
                    Arc::clone(&self.queue),
                    Arc::clone(&self.store),
                    Arc::clone(&self.handler),
                    Arc::clone(&self.progress),
                    self.tls.clone(),
                )));
            }
        }
    }

    fn enqueue(&self, available: AvailableFile) {
        if self.store.is_name_stored(&available.file_info.file_name)
            || self.store.in_progress(&available.file_info)
            || self.queue.contains(&available.file_info.file_name)
        {
            return;
        }
        debug!(file = %available.file_info.file_name, "adding file to request queue");
        self.queue.push(available);
    }
}

/// One slot lifetime: pop a request, run one transfer, end.
async fn run_slot(
    queue: Arc<RequestQueue>,
    store: Arc<Store>,
    handler: Arc<CryptoHandler>,
    progress: Arc<ProgressRegistry>,
    tls: Option<TlsConnector>,
) {
    let Some(available) = queue.try_pop() else {
        return;
    };
    if store.is_name_stored(&available.file_info.file_name)
        || store.in_progress(&available.file_info)
    {
        return;
    }

    let file_name = available.file_info.file_name.clone();
    if let Err(error) = transfer::download(available, store, handler, progress, tls).await {
        debug!(file = %file_name, %error, "transfer failed");
    }
}
