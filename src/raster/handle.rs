//! Long-lived rasterizer handles
//!
//! Each handle owns a dedicated worker thread holding the open document; the
//! engine's document type never crosses threads. Jobs flow through a bounded
//! channel whose depth is the handle's request buffer; a saturated queue
//! answers `Busy` so the HTTP layer can shed load with a 503.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{RenderBackend, RenderError, RenderJobSpec, RENDER_TIMEOUT};

/// Lifecycle of a handle. `Created` only exists while the worker is opening
/// the document; callers never see a handle before it is `Running`, and a
/// stopped handle is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Running,
    Stopped,
}

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

struct RenderJob {
    spec: RenderJobSpec,
    reply: oneshot::Sender<Result<Vec<u8>, RenderError>>,
}

pub struct Rasterizer {
    path: PathBuf,
    page_count: usize,
    sender: Mutex<Option<mpsc::Sender<RenderJob>>>,
    state: AtomicU8,
}

impl Rasterizer {
    /// Open `path` with the backend on a fresh worker thread. Resolves once
    /// the document is open and its page count is known.
    pub(crate) async fn open(
        backend: Arc<dyn RenderBackend>,
        path: PathBuf,
        buffer_size: usize,
    ) -> Result<Arc<Self>, RenderError> {
        let (tx, mut rx) = mpsc::channel::<RenderJob>(buffer_size.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<usize, RenderError>>();

        let worker_path = path.clone();
        std::thread::Builder::new()
            .name("rasterizer".to_string())
            .spawn(move || {
                let doc = match backend.open(&worker_path) {
                    Ok(doc) => doc,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(doc.page_count()));

                while let Some(job) = rx.blocking_recv() {
                    // The requester vanished (client disconnect, timeout);
                    // skip the work entirely.
                    if job.reply.is_closed() {
                        continue;
                    }
                    let result = doc.render_page(&job.spec);
                    let _ = job.reply.send(result);
                }
                debug!(path = %worker_path.display(), "render worker exiting");
            })
            .map_err(|e| RenderError::Engine(format!("failed to spawn render worker: {e}")))?;

        let page_count = ready_rx
            .await
            .map_err(|_| RenderError::Engine("render worker died while opening".to_string()))??;

        Ok(Arc::new(Rasterizer {
            path,
            page_count,
            sender: Mutex::new(Some(tx)),
            state: AtomicU8::new(STATE_RUNNING),
        }))
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn state(&self) -> HandleState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CREATED => HandleState::Created,
            STATE_RUNNING => HandleState::Running,
            _ => HandleState::Stopped,
        }
    }

    /// Render one page. Queue saturation answers `Busy` immediately rather
    /// than parking the request.
    pub async fn render(&self, spec: RenderJobSpec) -> Result<Vec<u8>, RenderError> {
        if spec.page >= self.page_count {
            return Err(RenderError::BadPage);
        }

        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(RenderError::Stopped)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .try_send(RenderJob {
                spec,
                reply: reply_tx,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => RenderError::Busy,
                mpsc::error::TrySendError::Closed(_) => RenderError::Stopped,
            })?;

        match tokio::time::timeout(RENDER_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RenderError::Stopped),
            Err(_) => Err(RenderError::Timeout),
        }
    }

    /// Stop accepting jobs and let the worker drain and exit. Idempotent.
    pub fn stop(&self) {
        let sender = self.sender.lock().take();
        if sender.is_some() {
            self.state.store(STATE_STOPPED, Ordering::SeqCst);
            debug!(path = %self.path.display(), "rasterizer stopped");
        }
    }
}

impl Drop for Rasterizer {
    fn drop(&mut self) {
        self.stop();
    }
}
