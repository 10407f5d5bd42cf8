//! Scripted in-memory transport for exercising the orchestrators without a
//! network.

use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::{watch, Notify};

use crate::{
    plf::PlfHeader,
    transport::{ByteProgress, Connection, Payload, Transport, TransportError},
    version::PlfVersion,
};

const CHUNK_SIZE: usize = 1024;

#[derive(Default)]
struct State {
    responses: HashMap<String, Payload>,
    files: HashMap<String, Vec<u8>>,
    block_transfers: bool,
    block_requests: bool,
    fail_connects: bool,
    connects: Vec<(String, u16)>,
    gets: Vec<String>,
    downloads: Vec<String>,
    uploads: Vec<(String, Vec<u8>)>,
    cancels: usize,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
    transfer_started: Arc<Notify>,
    request_started: Arc<Notify>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Answer requests for `path` with `body`, announcing its true length.
    pub fn respond(&self, path: &str, body: &str) {
        self.respond_payload(path, Payload {
            data: body.as_bytes().to_vec(),
            declared_len: Some(body.len() as u64),
        });
    }

    pub fn respond_payload(&self, path: &str, payload: Payload) {
        self.state().responses.insert(path.to_owned(), payload);
    }

    /// Serve `data` to downloads of `path`.
    pub fn serve(&self, path: &str, data: &[u8]) {
        self.state().files.insert(path.to_owned(), data.to_vec());
    }

    /// Make downloads and uploads stop halfway until their connection is
    /// cancelled.
    pub fn block_transfers(&self) {
        self.state().block_transfers = true;
    }

    /// Make requests hang until their connection is cancelled.
    pub fn block_requests(&self) {
        self.state().block_requests = true;
    }

    pub fn fail_connects(&self) {
        self.state().fail_connects = true;
    }

    /// Wait until a blocking transfer has written its first half.
    pub async fn transfer_started(&self) {
        self.transfer_started.notified().await;
    }

    /// Wait until a blocking request is in flight.
    pub async fn request_started(&self) {
        self.request_started.notified().await;
    }

    pub fn connects(&self) -> Vec<(String, u16)> {
        self.state().connects.clone()
    }

    pub fn gets(&self) -> Vec<String> {
        self.state().gets.clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.state().downloads.clone()
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.state().uploads.clone()
    }

    /// Number of [`Connection::cancel`] calls, which includes regular closes.
    pub fn cancels(&self) -> usize {
        self.state().cancels
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    fn connect(&self, host: &str, port: u16, _secure: bool) -> Result<Self::Connection, TransportError> {
        let mut state = self.state();
        if state.fail_connects {
            return Err(TransportError::Connect {
                host: host.to_owned(),
                port,
                reason: "connection refused".to_owned(),
            });
        }
        state.connects.push((host.to_owned(), port));

        Ok(MockConnection {
            state: self.state.clone(),
            transfer_started: self.transfer_started.clone(),
            request_started: self.request_started.clone(),
            cancel: watch::channel(false).0,
        })
    }
}

pub struct MockConnection {
    state: Arc<Mutex<State>>,
    transfer_started: Arc<Notify>,
    request_started: Arc<Notify>,
    cancel: watch::Sender<bool>,
}

impl MockConnection {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn check_cancelled(&self) -> Result<(), TransportError> {
        if *self.cancel.borrow() {
            Err(TransportError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn wait_for_cancel(&self) {
        let mut receiver = self.cancel.subscribe();
        loop {
            let cancelled = *receiver.borrow_and_update();
            if cancelled || receiver.changed().await.is_err() {
                break;
            }
        }
    }

    /// Feed `data` through `sink` in chunks, stopping halfway if transfers
    /// are set to block.
    async fn transfer(
        &self,
        data: &[u8],
        mut sink: impl FnMut(&[u8]) -> Result<(), TransportError>,
        progress: ByteProgress<'_>,
    ) -> Result<u64, TransportError> {
        let total = data.len() as u64;
        let half = data.len() / 2;
        let block = self.state().block_transfers;

        let (first, second) = data.split_at(half);

        for chunk in first.chunks(CHUNK_SIZE) {
            sink(chunk)?;
        }
        progress(half as u64, Some(total));

        if block {
            self.transfer_started.notify_one();
            self.wait_for_cancel().await;
        }
        self.check_cancelled()?;

        for chunk in second.chunks(CHUNK_SIZE) {
            sink(chunk)?;
        }
        progress(total, Some(total));

        Ok(total)
    }
}

impl Connection for MockConnection {
    async fn get(&self, path: &str) -> Result<Payload, TransportError> {
        self.check_cancelled()?;

        let block = {
            let mut state = self.state();
            state.gets.push(path.to_owned());
            state.block_requests
        };

        if block {
            self.request_started.notify_one();
            self.wait_for_cancel().await;
            self.check_cancelled()?;
        }

        self.state().responses.get(path)
            .cloned()
            .ok_or(TransportError::Status(404))
    }

    async fn download(
        &self,
        path: &str,
        dest: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64, TransportError> {
        self.check_cancelled()?;

        let data = {
            let mut state = self.state();
            state.downloads.push(path.to_owned());
            state.files.get(path).cloned().ok_or(TransportError::Status(404))?
        };

        let mut file = fs::File::create(dest)?;
        self.transfer(&data, |chunk| {
            file.write_all(chunk)?;
            Ok(())
        }, progress).await
    }

    async fn upload(
        &self,
        local: &Path,
        remote_name: &str,
        progress: ByteProgress<'_>,
    ) -> Result<u64, TransportError> {
        self.check_cancelled()?;

        let data = fs::read(local)?;
        let mut sent = vec![];
        let n = self.transfer(&data, |chunk| {
            sent.extend_from_slice(chunk);
            Ok(())
        }, progress).await?;

        self.state().uploads.push((remote_name.to_owned(), sent));

        Ok(n)
    }

    fn cancel(&self) -> Result<(), TransportError> {
        self.cancel.send_replace(true);
        self.state().cancels += 1;
        Ok(())
    }
}

/// A PLF image carrying `version` followed by `body`.
pub fn plf_image(version: PlfVersion, body: &[u8]) -> Vec<u8> {
    let header = PlfHeader {
        version,
        ..Default::default()
    };

    let mut data = header.to_bytes().to_vec();
    data.extend_from_slice(body);
    data
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
