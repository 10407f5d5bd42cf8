use std::{
    future::Future,
    io,
    path::Path,
};

use bytes::Bytes;
use log::{debug, trace};
use reqwest::{header::CONTENT_LENGTH, Body, Client, Response, Url};
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    sync::{mpsc, watch},
};
use tokio_stream::StreamExt;

use crate::transport::{ByteProgress, Connection, Payload, Transport, TransportError};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

fn check_status(r: &Response) -> Result<(), TransportError> {
    let status = r.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status(status.as_u16()))
    }
}

/// Resolves once `receiver` observes a cancel request.
async fn cancel_requested(mut receiver: watch::Receiver<bool>) {
    loop {
        let cancelled = *receiver.borrow_and_update();
        if cancelled {
            return;
        }
        if receiver.changed().await.is_err() {
            // The connection is gone, so nothing can cancel anymore
            std::future::pending::<()>().await;
        }
    }
}

/// Plain HTTP(S) transport backed by a shared [`reqwest::Client`]. Uploads are
/// sent as `PUT <base>/<remote name>`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with a default client. This fails if the TLS
    /// backend fails to initialize.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(USER_AGENT)
            .referer(false)
            .build()?;

        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    type Connection = HttpConnection;

    fn connect(&self, host: &str, port: u16, secure: bool) -> Result<Self::Connection, TransportError> {
        let scheme = if secure { "https" } else { "http" };
        let base_url = format!("{scheme}://{host}:{port}");

        // Catch bad hosts here rather than on every request
        Url::parse(&base_url).map_err(|e| TransportError::Connect {
            host: host.to_owned(),
            port,
            reason: e.to_string(),
        })?;

        Ok(HttpConnection {
            client: self.client.clone(),
            base_url,
            cancel: watch::channel(false).0,
        })
    }
}

/// Requests against one host. Cancelling the connection aborts the request in
/// flight and every later one.
#[derive(Debug)]
pub struct HttpConnection {
    client: Client,
    base_url: String,
    cancel: watch::Sender<bool>,
}

impl HttpConnection {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Run `f` unless the connection is cancelled first.
    async fn guarded<R>(
        &self,
        f: impl Future<Output = Result<R, TransportError>>,
    ) -> Result<R, TransportError> {
        let cancelled = cancel_requested(self.cancel.subscribe());

        tokio::select! {
            biased;
            _ = cancelled => {
                debug!("Request to {} was cancelled", self.base_url);
                Err(TransportError::Cancelled)
            }
            r = f => r,
        }
    }
}

impl Connection for HttpConnection {
    async fn get(&self, path: &str) -> Result<Payload, TransportError> {
        let url = self.url(path);
        debug!("GET {url}");

        self.guarded(async move {
            let r = self.client.get(&url).send().await?;
            check_status(&r)?;

            let declared_len = r.content_length();
            let data = r.bytes().await?.to_vec();

            Ok(Payload { data, declared_len })
        }).await
    }

    async fn download(
        &self,
        path: &str,
        dest: &Path,
        progress: ByteProgress<'_>,
    ) -> Result<u64, TransportError> {
        let url = self.url(path);
        debug!("Downloading {url} to {dest:?}");

        self.guarded(async move {
            let r = self.client.get(&url).send().await?;
            check_status(&r)?;

            let total = r.content_length();
            let mut file = File::create(dest).await?;
            let mut stream = r.bytes_stream();
            let mut written = 0u64;

            progress(0, total);

            while let Some(data) = stream.next().await {
                let data = data?;
                file.write_all(&data).await?;
                written += data.len() as u64;
                trace!("Received {} bytes", data.len());

                progress(written, total);
            }

            file.flush().await?;

            match total {
                Some(t) if t != written => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Expected {t} bytes, but received {written} bytes"),
                ).into()),
                _ => Ok(written),
            }
        }).await
    }

    async fn upload(
        &self,
        local: &Path,
        remote_name: &str,
        progress: ByteProgress<'_>,
    ) -> Result<u64, TransportError> {
        let url = self.url(remote_name);
        debug!("Uploading {local:?} to {url}");

        let data = Bytes::from(tokio::fs::read(local).await?);
        let total = data.len() as u64;

        let chunks: Vec<Bytes> = (0..data.len())
            .step_by(UPLOAD_CHUNK_SIZE)
            .map(|i| data.slice(i..(i + UPLOAD_CHUNK_SIZE).min(data.len())))
            .collect();

        // The body reports each chunk as hyper pulls it
        let (tx, mut rx) = mpsc::unbounded_channel();
        let body = Body::wrap_stream(tokio_stream::iter(chunks).map(move |chunk| {
            // The receiver only goes away once the request is over
            let _ = tx.send(chunk.len() as u64);
            Ok::<_, io::Error>(chunk)
        }));

        let request = self.client.put(&url)
            .header(CONTENT_LENGTH, total)
            .body(body)
            .send();

        self.guarded(async move {
            tokio::pin!(request);
            let mut sent = 0u64;

            let r = loop {
                tokio::select! {
                    r = &mut request => break r?,
                    Some(n) = rx.recv() => {
                        sent += n;
                        progress(sent, Some(total));
                    }
                }
            };
            check_status(&r)?;

            progress(total, Some(total));

            Ok(total)
        }).await
    }

    fn cancel(&self) -> Result<(), TransportError> {
        self.cancel.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
        sync::oneshot,
    };

    use super::*;

    /// Read one request: the head, plus the body if it has a length.
    async fn read_request(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let mut buf = vec![];
        let head_end = loop {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "Client closed connection early");
            buf.extend_from_slice(&chunk[..n]);

            if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break i + 4;
            }
        };

        let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
        let body_len = head.lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .map_or(0, |(_, v)| v.trim().parse::<usize>().unwrap());

        let mut body = buf[head_end..].to_vec();
        while body.len() < body_len {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "Client closed connection early");
            body.extend_from_slice(&chunk[..n]);
        }

        (head, body)
    }

    /// Serve a single canned response. The request is sent back through the
    /// returned channel.
    async fn serve_once(response: Vec<u8>) -> (u16, oneshot::Receiver<(String, Vec<u8>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            stream.write_all(&response).await.unwrap();
            stream.shutdown().await.unwrap();
            let _ = tx.send(request);
        });

        (port, rx)
    }

    fn ok_response(body: &[u8]) -> Vec<u8> {
        let mut r = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len(),
        ).into_bytes();
        r.extend_from_slice(body);
        r
    }

    fn connect(port: u16) -> HttpConnection {
        let client = reqwest::ClientBuilder::new()
            .no_proxy()
            .build()
            .unwrap();

        HttpTransport::with_client(client).connect("127.0.0.1", port, false).unwrap()
    }

    #[test]
    fn test_connect() {
        let transport = HttpTransport::new().unwrap();

        let c = transport.connect("download.example.com", 80, false).unwrap();
        assert_eq!(c.base_url(), "http://download.example.com:80");
        assert_eq!(c.url("/a/b.php?x=1"), "http://download.example.com:80/a/b.php?x=1");
        assert_eq!(c.url("fw.plf"), "http://download.example.com:80/fw.plf");

        let c = transport.connect("192.168.42.1", 8443, true).unwrap();
        assert_eq!(c.base_url(), "https://192.168.42.1:8443");

        assert_matches!(transport.connect("bad host", 80, false), Err(TransportError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_get() {
        let (port, request) = serve_once(ok_response(b"0")).await;

        let payload = connect(port).get("/Drones/0901/update.php?product=0901").await.unwrap();
        assert_eq!(payload.data, b"0");
        assert_eq!(payload.declared_len, Some(1));

        let (head, _) = request.await.unwrap();
        assert!(head.starts_with("GET /Drones/0901/update.php?product=0901 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_get_status() {
        let (port, _) = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()).await;

        assert_matches!(connect(port).get("/missing").await, Err(TransportError::Status(404)));
    }

    #[tokio::test]
    async fn test_download() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tmp_fw.plf");
        let data: Vec<u8> = (0..=255).cycle().take(100_000).collect();
        let (port, _) = serve_once(ok_response(&data)).await;

        let mut last = (0, None);
        let n = connect(port).download("/fw.plf", &dest, &mut |c, t| last = (c, t)).await.unwrap();

        assert_eq!(n, data.len() as u64);
        assert_eq!(last, (n, Some(n)));
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_upload() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("fw.plf");
        let data: Vec<u8> = (0..=255).cycle().take(200_000).collect();
        std::fs::write(&local, &data).unwrap();
        let (port, request) = serve_once(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n".to_vec()).await;

        let mut last = 0;
        let n = connect(port).upload(&local, "fw.plf", &mut |c, _| last = c).await.unwrap();

        assert_eq!(n, data.len() as u64);
        assert_eq!(last, n);

        let (head, body) = request.await.unwrap();
        assert!(head.starts_with("PUT /fw.plf HTTP/1.1\r\n"));
        assert_eq!(body, data);
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        // Accepts the connection but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let connection = std::sync::Arc::new(connect(port));
        let task = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.get("/update.php").await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        connection.cancel().unwrap();
        connection.cancel().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_matches!(result, Err(TransportError::Cancelled));

        // Later requests fail without touching the network
        assert_matches!(connection.get("/update.php").await, Err(TransportError::Cancelled));

        server.abort();
    }
}
