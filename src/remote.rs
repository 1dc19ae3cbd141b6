use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::error::FivekError;

const COPY_CHUNK: usize = 64 * 1024;

/// Fetch-by-URL capability used by index building and acquisition.
///
/// One call is one attempt; retry policy lives with the caller so it can
/// tell transient failures from local ones.
pub trait RemoteSource: Send + Sync {
    /// Streams `url` into `destination`, which already exists and is empty.
    fn download(&self, url: &str, destination: &Path) -> Result<u64, FivekError>;
    fn fetch_text(&self, url: &str) -> Result<String, FivekError>;
}

#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
}

impl HttpRemote {
    pub fn new(timeout: Duration) -> Result<Self, FivekError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("fivek-dataset/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| FivekError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(3))
            .timeout(timeout)
            .build()
            .map_err(|err| FivekError::Http(err.to_string()))?;
        Ok(Self { client })
    }

    fn get(&self, url: &str) -> Result<Response, FivekError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FivekError::Http(format!("{url}: {err}")))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(FivekError::HttpStatus {
            status: response.status().as_u16(),
            url: url.to_string(),
        })
    }
}

impl RemoteSource for HttpRemote {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, FivekError> {
        let response = self.get(url)?;
        let mut file = File::create(destination).map_err(|err| {
            FivekError::Filesystem(format!("create {}: {err}", destination.display()))
        })?;
        let written = copy_body(response, &mut file, url, destination)?;
        file.sync_all().map_err(|err| {
            FivekError::Filesystem(format!("sync {}: {err}", destination.display()))
        })?;
        Ok(written)
    }

    fn fetch_text(&self, url: &str) -> Result<String, FivekError> {
        self.get(url)?
            .text()
            .map_err(|err| FivekError::Http(format!("{url}: {err}")))
    }
}

/// Copies the body, keeping read failures (network, retryable) apart from
/// write failures (local disk, not retryable).
fn copy_body<R: Read, W: Write>(
    mut body: R,
    sink: &mut W,
    url: &str,
    destination: &Path,
) -> Result<u64, FivekError> {
    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let read = match body.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FivekError::Http(format!("{url}: {err}"))),
        };
        sink.write_all(&buffer[..read]).map_err(|err| {
            FivekError::Filesystem(format!("write {}: {err}", destination.display()))
        })?;
        total += read as u64;
    }
}
