use std::path::Path;

use log::{debug, warn};

use crate::{
    check::DownloadUrl,
    error::UpdaterError,
    file,
    guard::ConnectionGuard,
    transport::{Connection, Endpoint, Transport},
};

/// Receives transfer progress as a percentage in `0..=100`.
pub type PercentSink<'a> = dyn Fn(u8) + Send + Sync + 'a;

pub type ProgressCallback = Box<PercentSink<'static>>;

/// Turns byte counts into percentages and only forwards a value when it is
/// larger than the last one sent, so the sink sees a non-decreasing sequence
/// no matter how the transport reports progress.
pub struct PercentProgress<'a> {
    sink: &'a PercentSink<'a>,
    last: Option<u8>,
}

impl<'a> PercentProgress<'a> {
    pub fn new(sink: &'a PercentSink<'a>) -> Self {
        Self {
            sink,
            last: None,
        }
    }

    pub fn update(&mut self, current: u64, total: Option<u64>) {
        let total = match total {
            Some(t) if t > 0 => t,
            _ => return,
        };

        let current = current.min(total);
        // Cannot overflow or exceed 100
        let percent = (u128::from(current) * 100 / u128::from(total)) as u8;

        self.emit(percent);
    }

    /// Report completion, regardless of what the transport announced.
    pub fn finish(&mut self) {
        self.emit(100);
    }

    fn emit(&mut self, percent: u8) {
        if self.last.map_or(true, |l| percent > l) {
            self.last = Some(percent);
            (self.sink)(percent);
        }
    }
}

/// Best-effort removal of a partially written staging file.
fn discard_staging(path: &Path) {
    if let Err(e) = file::delete_if_exists(path) {
        warn!("Could not delete partial download {:?}: {}", path, e);
    }
}

/// Download `url` into `staging` on a fresh download-phase connection. On any
/// failure, including cancellation, the partial staging file is deleted. The
/// canonical image is never touched here.
pub async fn download<T: Transport>(
    guard: &ConnectionGuard<T::Connection>,
    transport: &T,
    url: &DownloadUrl,
    staging: &Path,
    progress: &PercentSink<'_>,
) -> Result<u64, UpdaterError> {
    debug!("Downloading {} to {:?}", url, staging);

    let lease = guard.open(transport, &url.host, url.port, false)?;
    let mut percent = PercentProgress::new(progress);

    let result = match lease.connection()
        .download(&url.path, staging, &mut |c, t| percent.update(c, t))
        .await
    {
        Ok(n) => lease.close().map(|_| n),
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(n) => {
            percent.finish();
            debug!("Downloaded {} bytes to {:?}", n, staging);
            Ok(n)
        }
        Err(e) => {
            discard_staging(staging);
            Err(e)
        }
    }
}

/// Send `local` to the device at `endpoint` as `remote_name` on a fresh
/// upload-phase connection.
pub async fn upload<T: Transport>(
    guard: &ConnectionGuard<T::Connection>,
    transport: &T,
    endpoint: &Endpoint,
    local: &Path,
    remote_name: &str,
    progress: &PercentSink<'_>,
) -> Result<u64, UpdaterError> {
    debug!("Uploading {:?} to {} as {:?}", local, endpoint, remote_name);

    let lease = guard.open(transport, &endpoint.host, endpoint.port, endpoint.secure)?;
    let mut percent = PercentProgress::new(progress);

    let n = lease.connection()
        .upload(local, remote_name, &mut |c, t| percent.update(c, t))
        .await?;
    lease.close()?;
    percent.finish();

    debug!("Uploaded {} bytes from {:?}", n, local);

    Ok(n)
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
    };

    use assert_matches::assert_matches;

    use crate::{
        guard::Phase,
        mock::{MockConnection, MockTransport},
    };

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u8>>>, impl Fn(u8) + Send + Sync) {
        let seen = Arc::new(Mutex::new(vec![]));
        let seen_cb = seen.clone();
        (seen, move |p| seen_cb.lock().unwrap().push(p))
    }

    fn new_guard(phase: Phase) -> ConnectionGuard<MockConnection> {
        ConnectionGuard::new(phase, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_percent_progress() {
        let (seen, sink) = recorder();
        let mut progress = PercentProgress::new(&sink);

        progress.update(0, None);
        progress.update(0, Some(0));
        progress.update(0, Some(200));
        progress.update(50, Some(200));
        progress.update(40, Some(200));
        progress.update(50, Some(200));
        progress.update(u64::MAX, Some(u64::MAX));
        progress.update(300, Some(200));
        progress.finish();

        assert_eq!(*seen.lock().unwrap(), vec![0, 25, 100]);
    }

    #[tokio::test]
    async fn test_download() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("tmp_fw.plf");
        let data: Vec<u8> = (0..=255).cycle().take(10_000).collect();

        let transport = MockTransport::new();
        transport.serve("/fw/fw.plf", &data);
        let guard = new_guard(Phase::Download);
        let url = DownloadUrl::parse("http://cdn.example:8080/fw/fw.plf").unwrap();
        let (seen, sink) = recorder();

        let n = download(&guard, &transport, &url, &staging, &sink).await.unwrap();

        assert_eq!(n, data.len() as u64);
        assert_eq!(fs::read(&staging).unwrap(), data);
        assert_eq!(transport.connects(), vec![("cdn.example".to_owned(), 8080)]);
        assert!(!guard.is_open());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_download_failure_discards_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("tmp_fw.plf");
        fs::write(&staging, b"left over").unwrap();

        let transport = MockTransport::new();
        let guard = new_guard(Phase::Download);
        let url = DownloadUrl::parse("http://cdn.example/missing.plf").unwrap();

        assert_matches!(download(&guard, &transport, &url, &staging, &|_| {}).await,
                        Err(UpdaterError::Transport(_)));
        assert!(!staging.exists());
        assert!(!guard.is_open());
    }

    #[tokio::test]
    async fn test_download_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("tmp_fw.plf");

        let transport = MockTransport::new();
        transport.serve("/fw.plf", &[0u8; 4096]);
        transport.block_transfers();
        let guard = Arc::new(new_guard(Phase::Download));
        let url = DownloadUrl::parse("http://cdn.example/fw.plf").unwrap();

        let task = {
            let transport = transport.clone();
            let guard = guard.clone();
            let staging = staging.clone();
            tokio::spawn(async move {
                download(&*guard, &transport, &url, &staging, &|_| {}).await
            })
        };

        transport.transfer_started().await;
        assert!(staging.exists());
        guard.cancel().unwrap();

        assert_matches!(task.await.unwrap(), Err(UpdaterError::Cancelled));
        assert!(!staging.exists());
        assert!(!guard.is_open());
    }

    #[tokio::test]
    async fn test_upload() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("fw.plf");
        fs::write(&local, b"firmware").unwrap();

        let transport = MockTransport::new();
        let guard = new_guard(Phase::Upload);
        let endpoint = Endpoint::new("192.168.42.1", 21);
        let done = AtomicBool::new(false);

        let n = upload(&guard, &transport, &endpoint, &local, "remote.plf", &|p| {
            if p == 100 {
                done.store(true, Ordering::SeqCst);
            }
        }).await.unwrap();

        assert_eq!(n, 8);
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(transport.uploads(), vec![("remote.plf".to_owned(), b"firmware".to_vec())]);
        assert!(!guard.is_open());
    }
}
