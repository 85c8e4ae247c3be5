use std::{
    future::Future,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, warn};
use thiserror::Error;
use tokio::{sync::watch, task};
use tokio_util::sync::CancellationToken;

use crate::{
    decrypt,
    download,
    error::{ChecksumKind, Error, ErrorKind, Outcome},
    identifier::FirmwareIdentifier,
    key,
    progress::{Phase, Progress, ProgressEvent, ProgressObserver, ProgressReporter},
    session::{FirmwareService, FirmwareSession},
    sink::{DownloadSink, StorageProvider},
    throughput::{DEFAULT_WINDOW, MIN_WINDOW},
    verify,
};

/// Default I/O chunk size for verification and decryption. This bounds the
/// cancellation latency of the blocking stages.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {0} has not been acknowledged yet")]
    Busy(u64),
    #[error("Job {0} is still running")]
    StillRunning(u64),
    #[error("Job {0} is not the current job")]
    UnknownJob(u64),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobState {
    /// The job was acknowledged and no longer occupies the controller
    Idle,
    Running,
    /// Cancellation was requested and takes effect at the next chunk boundary
    Cancelling,
    Completed,
    Failed(Failure),
    Cancelled,
}

impl JobState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled)
    }
}

/// Snapshot of an acquisition. Only the controller mutates it; observers get
/// copies.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: u64,
    pub identifier: FirmwareIdentifier,
    pub state: JobState,
    /// Active (or last active) phase, if any progress was reported
    pub phase: Option<Phase>,
    pub progress: Progress,
    /// Server-side name of the encrypted file, once known
    pub file_name: Option<String>,
    /// Name of the decrypted image, once known
    pub output_name: Option<String>,
}

impl Job {
    fn new(id: u64, identifier: FirmwareIdentifier) -> Self {
        Self {
            id,
            identifier,
            state: JobState::Running,
            phase: None,
            progress: Progress::default(),
            file_name: None,
            output_name: None,
        }
    }
}

/// Caller's reference to a started job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    id: u64,
    status: watch::Receiver<Job>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> Job {
        self.status.borrow().clone()
    }

    /// Receiver that is notified on every job update.
    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.status.clone()
    }

    /// Wait until the job is no longer running.
    pub async fn wait(&self) -> Job {
        let mut rx = self.status.clone();

        if let Ok(job) = rx.wait_for(|j| !j.state.is_active()).await {
            return job.clone();
        }

        // The controller was dropped; the last snapshot is final
        let job = rx.borrow().clone();
        job
    }
}

struct Slot {
    id: u64,
    status: Arc<watch::Sender<Job>>,
    cancel: CancellationToken,
}

struct Inner<S> {
    service: S,
    storage: Arc<dyn StorageProvider>,
    observer: Option<Arc<dyn ProgressObserver>>,
    chunk_size: usize,
    window: Duration,
    overwrite: bool,
    next_id: AtomicU64,
    slot: Mutex<Option<Slot>>,
}

impl<S> Inner<S> {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Slot>> {
        // The slot is never left in an inconsistent state, so a poisoned lock
        // is still usable
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct JobControllerBuilder<S> {
    service: S,
    storage: Arc<dyn StorageProvider>,
    observer: Option<Arc<dyn ProgressObserver>>,
    chunk_size: usize,
    window: Duration,
    overwrite: bool,
}

impl<S: FirmwareService> JobControllerBuilder<S> {
    /// Receive progress events and firmware metadata for every job.
    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Period over which the reported throughput is averaged. Clamped to
    /// [`MIN_WINDOW`].
    pub fn throughput_window(mut self, window: Duration) -> Self {
        self.window = window.max(MIN_WINDOW);
        self
    }

    /// Allow replacing a decrypted image that already exists. Off by default,
    /// in which case the job fails before downloading anything.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn build(self) -> JobController<S> {
        JobController {
            inner: Arc::new(Inner {
                service: self.service,
                storage: self.storage,
                observer: self.observer,
                chunk_size: self.chunk_size,
                window: self.window,
                overwrite: self.overwrite,
                next_id: AtomicU64::new(1),
                slot: Mutex::new(None),
            }),
        }
    }
}

/// Runs acquisitions, one at a time. A job occupies the controller from
/// [`Self::start_acquisition`] until its terminal state is acknowledged.
pub struct JobController<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for JobController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: FirmwareService> JobController<S> {
    pub fn builder(service: S, storage: Arc<dyn StorageProvider>) -> JobControllerBuilder<S> {
        JobControllerBuilder {
            service,
            storage,
            observer: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: DEFAULT_WINDOW,
            overwrite: false,
        }
    }

    /// Start acquiring the firmware on a background task. Fails without
    /// affecting the current job if one is running or not yet acknowledged.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_acquisition(&self, identifier: FirmwareIdentifier) -> Result<JobHandle, JobError> {
        let mut slot = self.inner.slot();
        if let Some(s) = slot.as_ref() {
            return Err(JobError::Busy(s.id));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(Job::new(id, identifier.clone()));
        let status = Arc::new(tx);
        let cancel = CancellationToken::new();

        *slot = Some(Slot {
            id,
            status: status.clone(),
            cancel: cancel.clone(),
        });

        debug!("Starting job {id}: {identifier}");
        tokio::spawn(supervise_job(self.inner.clone(), status, cancel, identifier));

        Ok(JobHandle { id, status: rx })
    }

    /// Request cancellation. Returns false if the job is not running.
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        let slot = self.inner.slot();
        let Some(s) = slot.as_ref().filter(|s| s.id == handle.id) else {
            return false;
        };

        let cancelled = s.status.send_if_modified(|j| {
            if j.state == JobState::Running {
                j.state = JobState::Cancelling;
                true
            } else {
                false
            }
        });
        if cancelled {
            debug!("Cancelling job {}", s.id);
            s.cancel.cancel();
        }

        cancelled
    }

    pub fn current_state(&self, handle: &JobHandle) -> Job {
        handle.state()
    }

    /// Release a finished job, resetting it to idle so another job can start.
    /// Returns the terminal snapshot.
    pub fn acknowledge(&self, handle: &JobHandle) -> Result<Job, JobError> {
        let mut slot = self.inner.slot();
        let Some(s) = slot.as_ref().filter(|s| s.id == handle.id) else {
            return Err(JobError::UnknownJob(handle.id));
        };

        let job = s.status.borrow().clone();
        if !job.state.is_terminal() {
            return Err(JobError::StillRunning(s.id));
        }

        s.status.send_modify(|j| j.state = JobState::Idle);
        *slot = None;

        Ok(job)
    }
}

/// Unwrap a stage outcome or stop the pipeline on cancellation.
macro_rules! proceed {
    ($e:expr) => {
        match $e {
            Outcome::Completed(v) => v,
            Outcome::Cancelled => return Ok(Outcome::Cancelled),
        }
    };
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T, Error>>,
) -> Result<Outcome<T>, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(Outcome::Cancelled),
        r = future => r.map(Outcome::Completed),
    }
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, Error> + Send + 'static,
) -> Result<T, Error> {
    task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Storage(io::Error::new(io::ErrorKind::Other, e)))?
}

/// Move a fully written file to its final name.
async fn commit(sink: &Arc<dyn DownloadSink>) -> Result<(), Error> {
    let sink = sink.clone();
    blocking(move || sink.commit().map_err(Error::Storage)).await
}

fn phase_reporter(
    status: &Arc<watch::Sender<Job>>,
    observer: &Option<Arc<dyn ProgressObserver>>,
    window: Duration,
    phase: Phase,
    max: u64,
) -> ProgressReporter<impl FnMut(Progress) + Send + 'static> {
    let status = status.clone();
    let observer = observer.clone();

    debug!("Entering phase: {phase}");

    ProgressReporter::new(max, window, move |progress| {
        status.send_modify(|j| {
            j.phase = Some(phase);
            j.progress = progress;
        });

        if let Some(o) = &observer {
            o.on_progress(&ProgressEvent { phase, progress });
        }
    })
}

struct Pipeline<'a, S> {
    inner: &'a Inner<S>,
    status: &'a Arc<watch::Sender<Job>>,
    cancel: &'a CancellationToken,
    /// File the user should delete if the current stage fails unrecoverably
    cleanup: Option<String>,
}

impl<S: FirmwareService> Pipeline<'_, S> {
    fn reporter(&self, phase: Phase, max: u64) -> ProgressReporter<impl FnMut(Progress) + Send + 'static> {
        phase_reporter(self.status, &self.inner.observer, self.inner.window, phase, max)
    }

    async fn run(&mut self, identifier: &FirmwareIdentifier) -> Result<Outcome<()>, Error> {
        let inner = self.inner;
        let cancel = self.cancel;

        let mut connecting = self.reporter(Phase::Connecting, 1);
        connecting.report(0);

        let mut session = proceed!(until_cancelled(cancel, inner.service.open()).await?);
        let info = proceed!(until_cancelled(cancel, session.request_binary_info(identifier)).await?);
        debug!("Binary info: {info:?}");

        self.status.send_modify(|j| {
            j.file_name = Some(info.file_name.clone());
            j.output_name = Some(info.output_name());
        });
        if let Some(o) = &inner.observer {
            o.on_binary_info(&info);
        }

        let decrypted = inner.storage.sink(&info.output_name()).map_err(Error::Storage)?;
        if !inner.overwrite && decrypted.exists().map_err(Error::Storage)? {
            return Err(Error::AlreadyExists(decrypted.location()));
        }

        proceed!(until_cancelled(cancel, session.init_binary_session(&info)).await?);
        let binary = proceed!(until_cancelled(cancel, session.open_binary(&info)).await?);
        connecting.report(1);

        // Download
        let encrypted = inner.storage.sink(&info.file_name).map_err(Error::Storage)?;
        {
            let output = encrypted.open_output().map_err(Error::Storage)?;
            let mut reporter = self.reporter(Phase::Download, info.size_bytes);

            proceed!(download::download(binary.stream, info.size_bytes, output,
                                        cancel, &mut reporter).await?);
        }
        commit(&encrypted).await?;

        self.cleanup = Some(encrypted.location());
        let size = info.size_bytes;
        let chunk_size = inner.chunk_size;

        if let Some(expected) = info.crc32 {
            let sink = encrypted.clone();
            let cancel = cancel.clone();
            let mut reporter = self.reporter(Phase::Crc32, size);

            let matched = proceed!(blocking(move || {
                let mut input = sink.open_input().map_err(Error::Storage)?;
                verify::verify_crc32(&mut input, size, expected, chunk_size, &cancel, &mut reporter)
            }).await?);

            if !matched {
                return Err(Error::ChecksumMismatch(ChecksumKind::Crc32));
            }
        }

        if let Some(expected) = binary.md5 {
            let sink = encrypted.clone();
            let cancel = cancel.clone();
            let mut reporter = self.reporter(Phase::Md5, size);

            let matched = proceed!(blocking(move || {
                let mut input = sink.open_input().map_err(Error::Storage)?;
                verify::verify_md5(&mut input, size, &expected, chunk_size, &cancel, &mut reporter)
            }).await?);

            if !matched {
                return Err(Error::ChecksumMismatch(ChecksumKind::Md5));
            }
        }

        let key = key::derive_key(
            &info.file_name,
            &info.version,
            &info.model,
            &info.region,
            info.logic_value.as_deref(),
        )?;

        // Decrypt
        let total_size = encrypted.byte_len().map_err(Error::Storage)?;
        self.cleanup = Some(decrypted.staging_location());

        {
            let decrypted = decrypted.clone();
            let cancel = cancel.clone();
            let mut reporter = self.reporter(Phase::Decrypt, total_size);

            proceed!(blocking(move || {
                let mut input = encrypted.open_input()
                    .map_err(|e| Error::Decryption(e.into()))?;
                let mut output = decrypted.open_output()
                    .map_err(|e| Error::Decryption(e.into()))?;

                decrypt::decrypt(&mut input, &mut output, &key, total_size, chunk_size,
                                 &cancel, &mut reporter)
            }).await?);
        }
        commit(&decrypted).await?;

        Ok(Outcome::Completed(()))
    }
}

async fn run_job<S: FirmwareService>(
    inner: Arc<Inner<S>>,
    status: Arc<watch::Sender<Job>>,
    cancel: CancellationToken,
    identifier: FirmwareIdentifier,
) {
    let mut pipeline = Pipeline {
        inner: &inner,
        status: &status,
        cancel: &cancel,
        cleanup: None,
    };

    let state = match pipeline.run(&identifier).await {
        Ok(Outcome::Completed(())) => JobState::Completed,
        Ok(Outcome::Cancelled) => JobState::Cancelled,
        // Errors from I/O interrupted by cancellation are not reported
        Err(e) if cancel.is_cancelled() => {
            debug!("Ignoring error after cancellation: {e}");
            JobState::Cancelled
        }
        Err(e) => {
            let message = match &pipeline.cleanup {
                Some(location) if e.requires_cleanup() => {
                    format!("{e}. Delete {location} and try again.")
                }
                _ => e.to_string(),
            };
            warn!("Job failed: {message}");

            JobState::Failed(Failure {
                kind: e.kind(),
                message,
            })
        }
    };

    debug!("Job finished: {state:?}");
    status.send_modify(|j| j.state = state);
}

/// Run the job on its own task so that a panic anywhere in the pipeline or in
/// the observer still ends in a terminal state.
async fn supervise_job<S: FirmwareService>(
    inner: Arc<Inner<S>>,
    status: Arc<watch::Sender<Job>>,
    cancel: CancellationToken,
    identifier: FirmwareIdentifier,
) {
    let task = tokio::spawn(run_job(inner, status.clone(), cancel.clone(), identifier));

    let Err(e) = task.await else {
        return;
    };

    warn!("Job task did not finish: {e}");

    let state = if cancel.is_cancelled() {
        JobState::Cancelled
    } else {
        JobState::Failed(Failure {
            kind: ErrorKind::Storage,
            message: format!("Job aborted unexpectedly: {e}"),
        })
    };

    status.send_if_modified(|j| {
        if j.state.is_active() {
            j.state = state;
            true
        } else {
            false
        }
    });
}
