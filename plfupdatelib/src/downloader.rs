use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::{
    check::{self, Descriptor, ProtocolError},
    checksum::{Checksum, Md5Checksum},
    constants::{SERIAL_PLACEHOLDER, SERVER_HOST, SERVER_PORT},
    error::{CompletionCallback, RunOutcome, Step, UpdaterError},
    file,
    guard::{ConnectionGuard, Phase},
    install,
    plf,
    product::Product,
    run::RunState,
    store::PlfStore,
    transfer::{self, ProgressCallback},
    transport::{Endpoint, Transport},
    version::PlfVersion,
};

pub type ShouldDownloadCallback = Box<dyn Fn(Product, bool) + Send + Sync>;

/// Builder type for creating downloaders with non-default behavior.
pub struct DownloaderBuilder<T: Transport> {
    root: PathBuf,
    transport: T,
    checksum: Arc<dyn Checksum>,
    server: Endpoint,
    serial: String,
    products: Vec<Product>,
    should_download: Option<ShouldDownloadCallback>,
    progress: Option<ProgressCallback>,
    completion: Option<CompletionCallback>,
}

impl<T: Transport> DownloaderBuilder<T> {
    pub fn new(root: impl Into<PathBuf>, transport: T) -> Self {
        Self {
            root: root.into(),
            transport,
            checksum: Arc::new(Md5Checksum),
            server: Endpoint::new(SERVER_HOST, SERVER_PORT),
            serial: SERIAL_PLACEHOLDER.to_owned(),
            products: Product::all().to_vec(),
            should_download: None,
            progress: None,
            completion: None,
        }
    }

    /// Digest used to verify downloads. Defaults to MD5.
    pub fn checksum(mut self, checksum: impl Checksum + 'static) -> Self {
        self.checksum = Arc::new(checksum);
        self
    }

    /// Update server to query. Defaults to the public Parrot server.
    pub fn server(mut self, server: Endpoint) -> Self {
        self.server = server;
        self
    }

    pub fn serial(mut self, serial: &str) -> Self {
        self.serial = serial.to_owned();
        self
    }

    /// Products to process, in order. Defaults to every known product.
    pub fn products(mut self, products: &[Product]) -> Self {
        self.products = products.to_vec();
        self
    }

    /// Called once per product with whether a download is needed.
    pub fn on_should_download(mut self, f: impl Fn(Product, bool) + Send + Sync + 'static) -> Self {
        self.should_download = Some(Box::new(f));
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

    pub fn build(self) -> Result<Downloader<T>, UpdaterError> {
        let store = PlfStore::new(&self.root)?;

        if self.serial.is_empty() || !self.serial.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(UpdaterError::BadParameter(format!("Invalid serial number: {:?}", self.serial)));
        } else if self.products.is_empty() {
            return Err(UpdaterError::BadParameter("No products to download".to_owned()));
        } else if self.server.host.is_empty() {
            return Err(UpdaterError::BadParameter("Server host is empty".to_owned()));
        }

        let cancelled = Arc::new(AtomicBool::new(false));

        Ok(Downloader {
            store,
            transport: self.transport,
            checksum: self.checksum,
            server: self.server,
            serial: self.serial,
            products: self.products,
            should_download: self.should_download,
            progress: self.progress,
            run: Arc::new(RunState::new(self.completion)),
            request: ConnectionGuard::new(Phase::Request, cancelled.clone()),
            download: ConnectionGuard::new(Phase::Download, cancelled.clone()),
            cancelled,
        })
    }
}

/// Brings the local firmware store up to date, one product at a time. Each
/// product goes through resolve, check, and if the server has something newer,
/// download, verify and install. The first failure ends the run.
///
/// A downloader can be cancelled from any thread. Cancellation is permanent:
/// later runs end immediately as cancelled.
pub struct Downloader<T: Transport> {
    store: PlfStore,
    transport: T,
    checksum: Arc<dyn Checksum>,
    server: Endpoint,
    serial: String,
    products: Vec<Product>,
    should_download: Option<ShouldDownloadCallback>,
    progress: Option<ProgressCallback>,
    run: Arc<RunState>,
    cancelled: Arc<AtomicBool>,
    request: ConnectionGuard<T::Connection>,
    download: ConnectionGuard<T::Connection>,
}

impl<T: Transport> fmt::Debug for Downloader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("store", &self.store)
            .field("server", &self.server)
            .field("products", &self.products)
            .field("run", &self.run)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Downloader<T> {
    pub fn store(&self) -> &PlfStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.run.is_running()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run in a background task. Fails with [`UpdaterError::ThreadBusy`] if a
    /// run is already in progress. Aborting the task ends the run as
    /// cancelled.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<RunOutcome>, UpdaterError> {
        let claim = RunState::begin(self.run.clone())?;

        let this = self.clone();
        Ok(tokio::spawn(async move { claim.finish(this.run_logged().await) }))
    }

    /// Run on the current task. Dropping the future ends the run as
    /// cancelled.
    pub async fn run(&self) -> Result<RunOutcome, UpdaterError> {
        let claim = RunState::begin(&*self.run)?;

        Ok(claim.finish(self.run_logged().await))
    }

    /// Stop the run. Any request or download in flight is interrupted and no
    /// further product is started. Safe to call at any time, any number of
    /// times.
    pub fn cancel(&self) -> Result<(), UpdaterError> {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("Cancelling download");
        }

        self.request.cancel()?;
        self.download.cancel()
    }

    async fn run_logged(&self) -> RunOutcome {
        let outcome = RunOutcome::from(self.run_products().await);

        match &outcome {
            RunOutcome::Completed => info!("Download run completed"),
            RunOutcome::Cancelled => info!("Download run cancelled"),
            RunOutcome::Failed(e) => error!("Download run failed: {}", e),
        }

        outcome
    }

    async fn run_products(&self) -> Result<(), UpdaterError> {
        for product in &self.products {
            if self.is_cancelled() {
                debug!("Cancelled before [{}]", product);
                return Err(UpdaterError::Cancelled);
            }

            self.process(*product).await?;
        }

        Ok(())
    }

    fn notify_should_download(&self, product: Product, needed: bool) {
        if let Some(cb) = &self.should_download {
            cb(product, needed);
        }
    }

    fn report_progress(&self, percent: u8) {
        if let Some(cb) = &self.progress {
            cb(percent);
        }
    }

    async fn process(&self, product: Product) -> Result<(), UpdaterError> {
        let resolved = Step::Resolve.report(product, self.store.resolve(product))?;
        debug!("[{}] Installed version: {}", product, PlfVersion::query_string(resolved.version));

        let descriptor = check::check(
            &self.request,
            &self.transport,
            &self.server,
            product,
            &self.serial,
            resolved.version,
        ).await;

        let (url, checksum) = match Step::Check.report(product, descriptor)? {
            Descriptor::UpToDate => {
                info!("[{}] Firmware is up to date", product);
                self.notify_should_download(product, false);
                return Ok(());
            }
            Descriptor::ServerError(kind) => {
                return Step::Check.report(product, Err(UpdaterError::Server(kind)));
            }
            Descriptor::Update { url, checksum } => (url, checksum),
        };

        // The image would never be found again under any other name
        if !plf::is_canonical_name(&url.file_name) {
            let e = ProtocolError::BadFileName(url.to_string());
            return Step::Check.report(product, Err(e.into()));
        }

        info!("[{}] Update available: {}", product, url);
        self.notify_should_download(product, true);

        let staging = self.store.staging_path(product, &url.file_name);
        let canonical = resolved.artifact
            .unwrap_or_else(|| resolved.dir.join(&url.file_name));

        let progress = |p| self.report_progress(p);
        let result = transfer::download(&self.download, &self.transport, &url, &staging, &progress).await;
        Step::Download.report(product, result)?;

        // A cancel that arrived after the last byte still prevents the install
        if self.is_cancelled() {
            if let Err(e) = file::delete_if_exists(&staging) {
                warn!("[{}] Could not delete {:?}: {}", product, staging, e);
            }
            return Step::Download.report(product, Err(UpdaterError::Cancelled));
        }

        let result = install::verify_and_install(self.checksum.clone(), &staging, &checksum, &canonical).await;
        let step = match &result {
            Err(UpdaterError::ChecksumMismatch { .. }) => Step::Verify,
            _ => Step::Install,
        };
        step.report(product, result)?;

        Ok(())
    }
}
