use std::{
    fmt,
    fs,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::{
    checksum::{Checksum, Md5Checksum},
    constants::MD5_FILE_NAME,
    error::{CompletionCallback, RunOutcome, Step, UpdaterError},
    file,
    guard::{ConnectionGuard, Phase},
    install,
    product::Product,
    run::RunState,
    store::PlfStore,
    transfer::{self, ProgressCallback},
    transport::{Endpoint, Transport},
};

/// Builder type for creating uploaders with non-default behavior.
pub struct UploaderBuilder<T: Transport> {
    root: PathBuf,
    transport: T,
    checksum: Arc<dyn Checksum>,
    product: Product,
    device: Endpoint,
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
}

impl<T: Transport> UploaderBuilder<T> {
    pub fn new(root: impl Into<PathBuf>, transport: T, product: Product, device: Endpoint) -> Self {
        Self {
            root: root.into(),
            transport,
            checksum: Arc::new(Md5Checksum),
            product,
            device,
            progress: None,
            completion: None,
        }
    }

    /// Digest sent alongside the image. Defaults to MD5.
    pub fn checksum(mut self, checksum: impl Checksum + 'static) -> Self {
        self.checksum = Arc::new(checksum);
        self
    }

    pub fn on_progress(mut self, f: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Called exactly once at the end of every run.
    pub fn on_completion(mut self, f: impl Fn(&RunOutcome) + Send + Sync + 'static) -> Self {
        self.completion = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<Uploader<T>, UpdaterError> {
        let store = PlfStore::new(&self.root)?;

        if self.device.host.is_empty() {
            return Err(UpdaterError::BadParameter("Device host is empty".to_owned()));
        }

        let cancelled = Arc::new(AtomicBool::new(false));

        Ok(Uploader {
            store,
            transport: self.transport,
            checksum: self.checksum,
            product: self.product,
            device: self.device,
            progress: self.progress,
            run: Arc::new(RunState::new(self.completion)),
            upload: ConnectionGuard::new(Phase::Upload, cancelled.clone()),
            cancelled,
        })
    }
}

/// Pushes the locally stored image of one product to a device, followed by a
/// small file holding its MD5 so the device can check what it received.
pub struct Uploader<T: Transport> {
    store: PlfStore,
    transport: T,
    checksum: Arc<dyn Checksum>,
    product: Product,
    device: Endpoint,
    progress: Option<ProgressCallback>,
    run: Arc<RunState>,
    cancelled: Arc<AtomicBool>,
    upload: ConnectionGuard<T::Connection>,
}

impl<T: Transport> fmt::Debug for Uploader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uploader")
            .field("product", &self.product)
            .field("device", &self.device)
            .field("run", &self.run)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Uploader<T> {
    pub fn product(&self) -> Product {
        self.product
    }

    pub fn is_running(&self) -> bool {
        self.run.is_running()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run in a background task. Fails with [`UpdaterError::ThreadBusy`] if a
    /// run is already in progress.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<RunOutcome>, UpdaterError> {
        let claim = RunState::begin(self.run.clone())?;

        let this = self.clone();
        Ok(tokio::spawn(async move { claim.finish(this.run_logged().await) }))
    }

    pub async fn run(&self) -> Result<RunOutcome, UpdaterError> {
        let claim = RunState::begin(&*self.run)?;

        Ok(claim.finish(self.run_logged().await))
    }

    /// Stop the run, interrupting the upload in flight. Safe to call at any
    /// time, any number of times.
    pub fn cancel(&self) -> Result<(), UpdaterError> {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("Cancelling upload");
        }

        self.upload.cancel()
    }

    async fn run_logged(&self) -> RunOutcome {
        let outcome = RunOutcome::from(self.upload_product().await);

        match &outcome {
            RunOutcome::Completed => info!("[{}] Upload completed", self.product),
            RunOutcome::Cancelled => info!("[{}] Upload cancelled", self.product),
            RunOutcome::Failed(e) => error!("[{}] Upload failed: {}", self.product, e),
        }

        outcome
    }

    fn report_progress(&self, percent: u8) {
        if let Some(cb) = &self.progress {
            cb(percent);
        }
    }

    fn check_cancelled(&self) -> Result<(), UpdaterError> {
        if self.is_cancelled() {
            Err(UpdaterError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn upload_product(&self) -> Result<(), UpdaterError> {
        let product = self.product;
        self.check_cancelled()?;

        let installed = self.store.installed(product)
            .and_then(|i| i.ok_or_else(|| UpdaterError::PlfFileNotFound(self.store.product_dir(product))));
        let (path, version) = Step::Resolve.report(product, installed)?;
        let name = path.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| UpdaterError::PlfFileNotFound(path.clone()))?
            .to_owned();

        info!("[{}] Uploading version {} to {}", product, version, self.device);

        let digest = install::compute_checksum(self.checksum.clone(), &path).await;
        let digest = Step::Upload.report(product, digest)?;
        debug!("[{}] Checksum of {:?}: {}", product, path, digest);

        let progress = |p| self.report_progress(p);
        let result = transfer::upload(&self.upload, &self.transport, &self.device, &path, &name, &progress).await;
        Step::Upload.report(product, result)?;

        Step::Upload.report(product, self.check_cancelled())?;

        let digest_path = path.with_file_name(MD5_FILE_NAME);
        Step::Upload.report(product, fs::write(&digest_path, &digest).map_err(UpdaterError::from))?;

        let result = transfer::upload(&self.upload, &self.transport, &self.device, &digest_path, MD5_FILE_NAME, &|_| {}).await;

        if let Err(e) = file::delete_if_exists(&digest_path) {
            warn!("[{}] Could not delete {:?}: {}", product, digest_path, e);
        }

        Step::Upload.report(product, result)?;

        Ok(())
    }
}
