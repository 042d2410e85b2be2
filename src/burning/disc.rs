//! Burn engine
//!
//! Enumerates recorders and drives one recorder through a write session:
//! - Validation happens on the caller's thread before anything native is touched
//! - The session itself runs on a dedicated `burn-worker` thread that owns
//!   every native object for the whole burn
//! - The caller only sees a one-shot completion (`BurnHandle`)
//!
//! Cancellation is observed up to the point the write starts. The write call
//! itself is not interruptible.

use futures::FutureExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

use super::recorder::{
    platform_subsystem, recorder_display_name, ProgressHandler, RecorderDescriptor,
    RecorderSubsystem, SessionConfig, SubscriptionToken, WriteSession,
};
use super::stream_bridge::StreamBridge;
use crate::core::{BurnProgress, BurnSettings, CancelToken};
use crate::error::{DiscError, Result};

/// Creates the recorder subsystem; called on the thread that will use it
pub type SubsystemFactory = Arc<dyn Fn() -> Result<Box<dyn RecorderSubsystem>> + Send + Sync>;

/// Receives burn progress, on whatever thread the recorder reports from
pub type BurnProgressCallback = Arc<dyn Fn(BurnProgress) + Send + Sync>;

/// Stages of a burn, logged as they are entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnStage {
    Idle,
    Validating,
    Initializing,
    Writing,
    Completed,
    Cancelled,
    Failed,
}

/// How a burn that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurnOutcome {
    Completed,
    Cancelled,
}

/// One-shot completion of a burn
///
/// Either block on it with `wait` or `.await` it.
pub struct BurnHandle {
    receiver: oneshot::Receiver<Result<BurnOutcome>>,
    worker: Option<JoinHandle<()>>,
}

impl BurnHandle {
    fn resolved(result: Result<BurnOutcome>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self {
            receiver,
            worker: None,
        }
    }

    /// Block until the burn finishes
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> Result<BurnOutcome> {
        let result = self.receiver.blocking_recv().unwrap_or_else(|_| Err(worker_lost()));
        if let Some(worker) = self.worker {
            let _ = worker.join();
        }
        result
    }
}

impl Future for BurnHandle {
    type Output = Result<BurnOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver
            .poll_unpin(cx)
            .map(|received| received.unwrap_or_else(|_| Err(worker_lost())))
    }
}

fn worker_lost() -> DiscError {
    DiscError::Io(std::io::Error::other(
        "burn worker exited without reporting a result",
    ))
}

pub struct BurnEngine {
    config: SessionConfig,
    factory: SubsystemFactory,
}

impl BurnEngine {
    /// Engine over the platform recorder subsystem
    pub fn new(settings: &BurnSettings) -> Self {
        let platform_settings = settings.clone();
        Self::with_subsystem(
            settings,
            Arc::new(move || platform_subsystem(&platform_settings)),
        )
    }

    pub fn with_subsystem(settings: &BurnSettings, factory: SubsystemFactory) -> Self {
        Self {
            config: SessionConfig::from(settings),
            factory,
        }
    }

    /// List available recorders
    ///
    /// Recorders whose id is blank are skipped. A recorder with no
    /// manufacturer or product id is named "Optical Drive".
    pub fn list_recorders(&self) -> Result<Vec<RecorderDescriptor>> {
        let subsystem = (self.factory)()?;
        let mut recorders = Vec::new();

        for unique_id in subsystem.recorder_ids()? {
            if unique_id.trim().is_empty() {
                log::debug!("Skipping recorder with blank id");
                continue;
            }
            let recorder = subsystem.open_recorder(&unique_id)?;
            let display_name =
                recorder_display_name(&recorder.manufacturer_id()?, &recorder.product_id()?);
            log::debug!("Found recorder {} ({})", display_name, unique_id);
            recorders.push(RecorderDescriptor {
                unique_id,
                display_name,
            });
        }

        log::info!("Found {} recorder(s)", recorders.len());
        Ok(recorders)
    }

    /// Burn an image to the recorder with the given id
    ///
    /// # Arguments
    /// * `image_path` - Image file to write
    /// * `recorder_id` - A `unique_id` from `list_recorders`
    /// * `on_progress` - Optional sink for recorder progress events
    /// * `cancel` - Observed until the write starts
    ///
    /// # Returns
    /// * `Err` right away for a blank path or id, or a missing image
    /// * A handle already resolved to `Cancelled` if `cancel` is set
    /// * Otherwise a handle resolved by the burn worker
    pub fn burn_image(
        &self,
        image_path: &Path,
        recorder_id: &str,
        on_progress: Option<BurnProgressCallback>,
        cancel: &CancelToken,
    ) -> Result<BurnHandle> {
        log::debug!("Burn stage: {:?}", BurnStage::Validating);
        if image_path.to_string_lossy().trim().is_empty() {
            return Err(DiscError::InvalidArgument("Image path is empty".to_string()));
        }
        if !image_path.is_file() {
            return Err(DiscError::NotFound(image_path.display().to_string()));
        }
        if recorder_id.trim().is_empty() {
            return Err(DiscError::InvalidArgument("Recorder id is empty".to_string()));
        }
        if cancel.is_cancelled() {
            log::info!("Burn cancelled before start");
            return Ok(BurnHandle::resolved(Ok(BurnOutcome::Cancelled)));
        }

        let job = BurnJob {
            factory: Arc::clone(&self.factory),
            config: self.config.clone(),
            image_path: image_path.to_path_buf(),
            recorder_id: recorder_id.to_string(),
            on_progress,
            cancel: cancel.clone(),
        };

        let (sender, receiver) = oneshot::channel();
        let worker = std::thread::Builder::new()
            .name("burn-worker".to_string())
            .spawn(move || {
                let result = job.run();
                let _ = sender.send(result);
            })?;

        Ok(BurnHandle {
            receiver,
            worker: Some(worker),
        })
    }
}

struct BurnJob {
    factory: SubsystemFactory,
    config: SessionConfig,
    image_path: PathBuf,
    recorder_id: String,
    on_progress: Option<BurnProgressCallback>,
    cancel: CancelToken,
}

impl BurnJob {
    fn run(self) -> Result<BurnOutcome> {
        let mut stage = BurnStage::Idle;
        let result = self.drive(&mut stage);

        match &result {
            Ok(BurnOutcome::Completed) => enter(&mut stage, BurnStage::Completed),
            Ok(BurnOutcome::Cancelled) => enter(&mut stage, BurnStage::Cancelled),
            Err(e) => {
                log::error!("Burn of {} failed: {}", self.image_path.display(), e);
                enter(&mut stage, BurnStage::Failed);
            }
        }
        result
    }

    fn drive(&self, stage: &mut BurnStage) -> Result<BurnOutcome> {
        enter(stage, BurnStage::Initializing);
        if self.cancel.is_cancelled() {
            return Ok(BurnOutcome::Cancelled);
        }

        let subsystem = (self.factory)()?;
        let recorder = subsystem.open_recorder(&self.recorder_id)?;
        if self.cancel.is_cancelled() {
            return Ok(BurnOutcome::Cancelled);
        }

        let mut session = subsystem.create_session(recorder, &self.config)?;
        if self.cancel.is_cancelled() {
            return Ok(BurnOutcome::Cancelled);
        }

        let mut source = StreamBridge::open_file(&self.image_path)?;

        enter(stage, BurnStage::Writing);
        log::info!(
            "Burning {} to {}",
            self.image_path.display(),
            self.recorder_id
        );

        let sink = self.on_progress.clone();
        let mut subscribed = Subscription::new(
            session.as_mut(),
            Arc::new(move |elapsed, estimated_total| {
                if let Some(callback) = &sink {
                    callback(BurnProgress::new(elapsed, estimated_total));
                }
            }),
        );
        subscribed.session.write(&mut source)?;
        Ok(BurnOutcome::Completed)
    }
}

/// Progress subscription that is removed again when dropped, including
/// while unwinding out of a panicking write
struct Subscription<'s> {
    session: &'s mut dyn WriteSession,
    token: SubscriptionToken,
}

impl<'s> Subscription<'s> {
    fn new(session: &'s mut dyn WriteSession, handler: ProgressHandler) -> Self {
        let token = session.subscribe(handler);
        Self { session, token }
    }
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        if !self.session.unsubscribe(self.token) {
            log::warn!("Progress subscription was already removed");
        }
    }
}

fn enter(stage: &mut BurnStage, next: BurnStage) {
    log::info!("Burn stage: {:?} -> {:?}", stage, next);
    *stage = next;
}
