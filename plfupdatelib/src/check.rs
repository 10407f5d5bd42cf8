use std::{
    fmt,
    str,
};

use log::debug;
use thiserror::Error;

use crate::{
    error::UpdaterError,
    guard::ConnectionGuard,
    product::Product,
    transport::{Connection, Endpoint, Payload, Transport},
    version::PlfVersion,
};

const HTTP_SCHEME: &str = "http://";
const DEFAULT_HTTP_PORT: u16 = 80;
const FIELD_SEPARATOR: char = '|';
const MD5_HEX_LEN: usize = 32;

const STATUS_OK: &str = "0";
const STATUS_UNKNOWN: &str = "1";
const STATUS_FILE: &str = "2";
const STATUS_PLF: &str = "3";
const STATUS_MAGIC_PLF: &str = "4";
const STATUS_UPDATE: &str = "5";

/// Errors the update server reports about its own state
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerErrorKind {
    Unknown,
    File,
    Plf,
    MagicPlf,
}

impl fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown error",
            Self::File => "firmware file not found",
            Self::Plf => "invalid PLF file",
            Self::MagicPlf => "bad PLF magic",
        })
    }
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProtocolError {
    #[error("Response declares {declared} bytes, but {actual} bytes were received")]
    LengthMismatch {
        declared: u64,
        actual: u64,
    },
    #[error("Response contains a NUL byte at offset {0}")]
    EmbeddedNul(usize),
    #[error("Response is not UTF-8 text")]
    NotText,
    #[error("Response is empty")]
    Empty,
    #[error("Unknown status code: {0:?}")]
    UnknownStatus(String),
    #[error("Update response is missing the {0} field")]
    MissingField(&'static str),
    #[error("Update response has {0} fields instead of 3")]
    TooManyFields(usize),
    #[error("Invalid checksum: {0:?}")]
    BadChecksum(String),
    #[error("Download URL does not start with http://: {0:?}")]
    BadScheme(String),
    #[error("Download URL has an invalid host: {0:?}")]
    BadHost(String),
    #[error("Download URL has no path: {0:?}")]
    MissingPath(String),
    #[error("Download URL has no usable file name: {0:?}")]
    BadFileName(String),
}

/// Location of a firmware image, split the way the transfer engine needs it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DownloadUrl {
    pub host: String,
    pub port: u16,
    /// Path component, starting with `/`
    pub path: String,
    /// Last path segment, used to name the file on disk
    pub file_name: String,
}

impl DownloadUrl {
    pub fn parse(url: &str) -> Result<Self, ProtocolError> {
        let rest = url.strip_prefix(HTTP_SCHEME)
            .ok_or_else(|| ProtocolError::BadScheme(url.to_owned()))?;
        let slash = rest.find('/')
            .ok_or_else(|| ProtocolError::MissingPath(url.to_owned()))?;
        let (authority, path) = rest.split_at(slash);

        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => {
                let port = p.parse()
                    .map_err(|_| ProtocolError::BadHost(authority.to_owned()))?;
                (h, port)
            }
            None => (authority, DEFAULT_HTTP_PORT),
        };
        if host.is_empty() {
            return Err(ProtocolError::BadHost(authority.to_owned()));
        }

        let file_name = match path.rsplit_once('/') {
            Some((_, name)) => name,
            None => path,
        };
        // The name is joined onto a local directory
        if file_name.is_empty() || file_name == "." || file_name == ".." || file_name.contains('\\') {
            return Err(ProtocolError::BadFileName(url.to_owned()));
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            path: path.to_owned(),
            file_name: file_name.to_owned(),
        })
    }
}

impl fmt::Display for DownloadUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_HTTP_PORT {
            write!(f, "{}{}{}", HTTP_SCHEME, self.host, self.path)
        } else {
            write!(f, "{}{}:{}{}", HTTP_SCHEME, self.host, self.port, self.path)
        }
    }
}

/// Parsed version check response
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Descriptor {
    /// The installed image is current
    UpToDate,
    /// A newer image is available
    Update {
        url: DownloadUrl,
        /// Expected MD5 of the image as hex text
        checksum: String,
    },
    /// The server could not answer the query
    ServerError(ServerErrorKind),
}

/// Build the path and query of the version check request for a product.
pub fn query_path(product: Product, serial: &str, version: Option<PlfVersion>) -> String {
    let hex = product.hex();
    format!(
        "/Drones/{hex}/update.php?product={hex}&serialNo={serial}&version={}",
        PlfVersion::query_string(version),
    )
}

/// Parse a `<status>[|<url>|<md5>]` version check response. The payload must
/// be exactly as long as the server said it would be and must be plain text.
pub fn parse_response(payload: &Payload) -> Result<Descriptor, ProtocolError> {
    let actual = payload.data.len() as u64;
    if let Some(declared) = payload.declared_len {
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }
    }
    if let Some(n) = payload.data.iter().position(|b| *b == 0) {
        return Err(ProtocolError::EmbeddedNul(n));
    }

    let text = str::from_utf8(&payload.data)
        .map_err(|_| ProtocolError::NotText)?
        .trim();
    let mut fields = text.split(FIELD_SEPARATOR);
    let status = fields.next().unwrap_or_default();

    match status {
        "" => Err(ProtocolError::Empty),
        STATUS_OK => Ok(Descriptor::UpToDate),
        STATUS_UNKNOWN => Ok(Descriptor::ServerError(ServerErrorKind::Unknown)),
        STATUS_FILE => Ok(Descriptor::ServerError(ServerErrorKind::File)),
        STATUS_PLF => Ok(Descriptor::ServerError(ServerErrorKind::Plf)),
        STATUS_MAGIC_PLF => Ok(Descriptor::ServerError(ServerErrorKind::MagicPlf)),
        STATUS_UPDATE => {
            let mut rest: Vec<&str> = fields.collect();
            // Tolerate a trailing separator
            if rest.len() == 3 && rest[2].is_empty() {
                rest.pop();
            }
            if rest.len() > 2 {
                return Err(ProtocolError::TooManyFields(rest.len() + 1));
            }

            let url = rest.first()
                .filter(|s| !s.is_empty())
                .ok_or(ProtocolError::MissingField("download URL"))?;
            let checksum = rest.get(1)
                .filter(|s| !s.is_empty())
                .ok_or(ProtocolError::MissingField("checksum"))?;

            if checksum.len() != MD5_HEX_LEN || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ProtocolError::BadChecksum((*checksum).to_owned()));
            }

            Ok(Descriptor::Update {
                url: DownloadUrl::parse(url)?,
                checksum: (*checksum).to_owned(),
            })
        }
        s => Err(ProtocolError::UnknownStatus(s.to_owned())),
    }
}

/// Ask the update server whether a newer image exists for `product`. This is a
/// single request/response exchange on a fresh request-phase connection. The
/// phase lock is only held while the connection is opened and torn down, so
/// [`ConnectionGuard::cancel`] can interrupt the request itself.
pub async fn check<T: Transport>(
    guard: &ConnectionGuard<T::Connection>,
    transport: &T,
    server: &Endpoint,
    product: Product,
    serial: &str,
    version: Option<PlfVersion>,
) -> Result<Descriptor, UpdaterError> {
    let path = query_path(product, serial, version);
    debug!("[{}] Checking for update at {}{}", product, server, path);

    let lease = guard.open(transport, &server.host, server.port, server.secure)?;
    let payload = lease.connection().get(&path).await?;
    lease.close()?;

    debug!("[{}] Version check response: {:?}", product, String::from_utf8_lossy(&payload.data));

    Ok(parse_response(&payload)?)
}
