mod config;

use std::{
    fmt,
    io::{self, stderr, Stderr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, Level, log_enabled};
use tokio::{signal::ctrl_c, task::JoinHandle};

use plfupdatelib::{
    downloader::DownloaderBuilder,
    error::{RunOutcome, UpdaterError},
    http::HttpTransport,
    manager::Manager,
    product::Product,
    store::PlfStore,
    transport::Endpoint,
    uploader::UploaderBuilder,
    version::PlfVersion,
};
use progresslib::{ProgressBar, ProgressDrawMode};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");

type SharedBar = Arc<Mutex<ProgressBar<Stderr>>>;

/// Create a new progress bar. The progress bar is not immediately rendered.
fn create_progress_bar() -> SharedBar {
    let mut bar = ProgressBar::new(stderr());
    if log_enabled!(Level::Debug) {
        // The escape sequences for the interactive progress bar would clobber
        // log messages.
        bar.set_mode(Some(ProgressDrawMode::Append));
    }

    Arc::new(Mutex::new(bar))
}

/// Apply `f` to the shared bar. Callbacks run on the worker, so rendering
/// failures are only logged.
fn with_bar(bar: &SharedBar, f: impl FnOnce(&mut ProgressBar<Stderr>) -> io::Result<()>) {
    match bar.lock() {
        Ok(mut b) => {
            if let Err(e) = f(&mut b) {
                debug!("Could not draw progress bar: {}", e);
            }
        }
        Err(_) => debug!("Progress bar lock is poisoned"),
    }
}

/// Wait for the worker to exit. If the user hits ctrl-c first, request
/// cancellation and keep waiting so the in-flight connection is torn down.
async fn wait_for_worker(
    mut handle: JoinHandle<RunOutcome>,
    cancel: impl FnOnce() -> Result<(), UpdaterError>,
) -> Result<RunOutcome> {
    tokio::select! {
        r = &mut handle => {
            return r.context("Unexpected panic in worker task");
        }
        c = ctrl_c() => {
            c.context("Could not listen for ctrl-c")?;
        }
    }

    eprintln!("Cancelling ...");
    cancel().context("Could not cancel worker")?;

    handle.await.context("Unexpected panic in worker task")
}

fn check_outcome(outcome: RunOutcome, what: &str) -> Result<()> {
    if outcome.is_cancelled() {
        return Err(anyhow!("{} was interrupted", what));
    }

    outcome.into_result().with_context(|| format!("{} failed", what))
}

fn print_inventory(root: &Path, products: &[Product]) -> Result<()> {
    let store = PlfStore::new(root)?;

    println!("PLF folder: {:?}", store.plf_folder());

    for (product, version) in store.inventory(products) {
        match version {
            Ok(Some(v)) => println!("- {} ({}): {}", product, product.name(), v),
            Ok(None) => println!("- {} ({}): not installed", product, product.name()),
            Err(e) => println!("- {} ({}): error: {}", product, product.name(), e),
        }
    }

    Ok(())
}

async fn download(
    manager: &Manager<HttpTransport>,
    root: &Path,
    server: Endpoint,
    products: &[Product],
) -> Result<()> {
    let transport = HttpTransport::new()
        .context("Could not initialize HTTP client")?;
    let bar = create_progress_bar();

    let should_download_bar = bar.clone();
    let progress_bar = bar.clone();

    let downloader = DownloaderBuilder::new(root, transport)
        .server(server)
        .products(products)
        .on_should_download(move |product, needed| {
            if needed {
                with_bar(&should_download_bar, |b| b.reset(format!("{} ({})", product, product.name())));
            } else {
                with_bar(&should_download_bar, |b| b.println(format!("{} is up to date", product)));
            }
        })
        .on_progress(move |percent| with_bar(&progress_bar, |b| b.set_percent(percent)))
        .build()?;
    let downloader = manager.set_downloader(downloader)?;

    debug!("Checking {} products against {}", products.len(), downloader.store().plf_folder().display());

    let handle = downloader.start()?;
    let outcome = wait_for_worker(handle, || downloader.cancel()).await?;

    manager.delete_downloader()?;
    // The callbacks hold the other references, so this finishes the bar
    drop(downloader);
    drop(bar);

    check_outcome(outcome, "Download")?;

    print_inventory(root, products)
}

async fn upload(
    manager: &Manager<HttpTransport>,
    root: &Path,
    product: Product,
    device: Endpoint,
) -> Result<()> {
    let transport = HttpTransport::new()
        .context("Could not initialize HTTP client")?;
    let bar = create_progress_bar();
    with_bar(&bar, |b| b.set_label(format!("{} -> {}", product, device)));

    let progress_bar = bar.clone();

    let uploader = UploaderBuilder::new(root, transport, product, device)
        .on_progress(move |percent| with_bar(&progress_bar, |b| b.set_percent(percent)))
        .build()?;
    let uploader = manager.set_uploader(uploader)?;

    let handle = uploader.start()?;
    let outcome = wait_for_worker(handle, || uploader.cancel()).await?;

    manager.delete_uploader()?;
    drop(uploader);
    drop(bar);

    check_outcome(outcome, "Upload")
}

fn check_device(
    manager: &Manager<HttpTransport>,
    root: &Path,
    product: Product,
    device_version: PlfVersion,
) -> Result<()> {
    let (up_to_date, local) = manager.plf_version_is_up_to_date(root, product, device_version)?;

    match local {
        Some(v) => println!("Local PLF for {}: {}", product, v),
        None => println!("No local PLF for {}", product),
    }

    if up_to_date {
        println!("Device running {} is up to date", device_version);
    } else {
        println!("Device running {} needs an update", device_version);
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => f.write_str("debug"),
            Self::Trace => f.write_str("trace"),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the locally stored firmware version of every product
    Status,
    /// Fetch the latest firmware of every product from the update server
    ///
    /// Products whose stored firmware is already current are skipped. The run
    /// stops at the first product that fails.
    Download {
        /// Only check this product (4-digit hex ID, eg. 090c)
        ///
        /// Can be passed multiple times. All known products are checked if
        /// unspecified.
        #[arg(short, long = "product")]
        products: Vec<Product>,
    },
    /// Send the stored firmware of a product to a device
    ///
    /// The firmware is followed by an `md5_check.md5` file holding its MD5
    /// digest so that the device can validate what it received.
    Upload {
        /// Product whose firmware is sent (4-digit hex ID, eg. 090c)
        #[arg(short, long)]
        product: Product,
        /// Device address as <host>[:<port>]
        #[arg(short, long)]
        device: Endpoint,
    },
    /// Tell whether a device needs the stored firmware
    CheckDevice {
        /// Product of the device (4-digit hex ID, eg. 090c)
        #[arg(short, long)]
        product: Product,
        /// Firmware version the device runs (eg. 4.0.6)
        #[arg(short = 'v', long)]
        device_version: PlfVersion,
    },
}

/// A tool for keeping Parrot firmware (PLF) files up to date and pushing them
/// to devices.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Opts {
    /// Firmware root folder
    ///
    /// Firmware files are stored in <root>/plfFolder/<product>/. If
    /// unspecified, the `root_folder` config file variable is used, followed
    /// by a directory in the user's data directory.
    #[arg(long, global = true, env = "PLFUPDATE_ROOT")]
    root: Option<PathBuf>,
    /// Update server host
    #[arg(long, global = true)]
    server: Option<String>,
    /// Update server port
    #[arg(long, global = true)]
    server_port: Option<u16>,
    /// Set logging verbosity
    ///
    /// By default, no log messages are printed out. If set to 'debug', the
    /// per-product steps are printed out. If set to 'trace', every transport
    /// exchange is also printed out. This option overrides the RUST_LOG
    /// environment variable, which would otherwise be respected if this option
    /// was not passed.
    #[arg(value_enum, long, global = true)]
    loglevel: Option<LogLevel>,
    /// Config file path
    ///
    /// If unspecified, the default config file path is used. The config file
    /// can store the root folder and server address.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    if let Some(l) = opts.loglevel {
        std::env::set_var("RUST_LOG", format!("{}={},plfupdatelib={}", PKG_NAME, l, l));
    }

    env_logger::init();

    debug!("Arguments: {:#?}", opts);

    let config = config::load_config_file(opts.config.as_deref())?;
    debug!("Config: {:#?}", config);

    let root = config::root_folder(opts.root.as_deref(), config.as_ref())?;
    debug!("Root folder: {:?}", root);

    let manager = Manager::new();

    match opts.command {
        Command::Status => print_inventory(&root, Product::all()),
        Command::Download { products } => {
            let server = config::server(opts.server.as_deref(), opts.server_port, config.as_ref());
            let products = if products.is_empty() {
                Product::all().to_vec()
            } else {
                products
            };

            download(&manager, &root, server, &products).await
        }
        Command::Upload { product, device } => upload(&manager, &root, product, device).await,
        Command::CheckDevice { product, device_version } => {
            check_device(&manager, &root, product, device_version)
        }
    }
}
