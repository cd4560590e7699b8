//! HTTP chunk downloader adapter.
//!
//! Implements [`Downloader`]: one GET per call, response body delivered to
//! the sink in fixed-size chunks with a consistent `total_size` taken from
//! Content-Length.  The sink can stop the transfer cleanly
//! ([`ChunkAction::Abort`]) or abort it with an error; either way the
//! connection is dropped mid-stream.
//!
//! The host build has no real network backend — the simulation agent
//! never downloads, and tests drive the engine with scripted downloaders.

use core::time::Duration;

use crate::app::ports::{ChunkAction, DownloadChunk, Downloader};
use crate::error::OtaError;

#[cfg(target_os = "espidf")]
const READ_BUF_SIZE: usize = 2048;

/// HTTP(S) downloader for firmware images.
pub struct HttpDownloader;

impl HttpDownloader {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader for HttpDownloader {
    #[cfg(target_os = "espidf")]
    fn download(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
        sink: &mut dyn FnMut(&DownloadChunk<'_>) -> Result<ChunkAction, OtaError>,
    ) -> Result<(), OtaError> {
        use embedded_svc::http::client::Client;
        use embedded_svc::http::{Headers, Method, Status};
        use embedded_svc::io::Read;
        use esp_idf_svc::http::client::{Configuration, EspHttpConnection, FollowRedirectsPolicy};
        use log::{debug, warn};
        use std::time::Instant;

        let connection = EspHttpConnection::new(&Configuration {
            timeout: Some(timeout),
            follow_redirects_policy: FollowRedirectsPolicy::FollowAll,
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        })
        .map_err(|e| {
            warn!("HTTP: connection setup failed: {}", e);
            OtaError::Network
        })?;
        let mut client = Client::wrap(connection);

        let request = client
            .request(Method::Get, url, headers)
            .map_err(|e| {
                warn!("HTTP: request build failed: {}", e);
                OtaError::Network
            })?;
        let mut response = request.submit().map_err(|e| {
            warn!("HTTP: request failed: {}", e);
            OtaError::Network
        })?;

        let status = response.status();
        if !(200..300).contains(&status) {
            warn!("HTTP: server answered {}", status);
            return Err(OtaError::HttpRequest);
        }

        let total_size: usize = response
            .header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        debug!("HTTP: downloading {} bytes from {}", total_size, url);

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut offset = 0usize;

        loop {
            if Instant::now() >= deadline {
                warn!("HTTP: download timed out after {:?}", timeout);
                return Err(OtaError::Network);
            }

            let n = response.read(&mut buf).map_err(|e| {
                warn!("HTTP: read failed: {}", e);
                OtaError::Network
            })?;

            if n == 0 {
                // EOF without a size-flagged last chunk: flush the writer
                // with an empty terminal chunk.
                if total_size == 0 || offset < total_size {
                    sink(&DownloadChunk {
                        data: &[],
                        offset,
                        total_size,
                        last: true,
                    })?;
                }
                return Ok(());
            }

            let last = total_size > 0 && offset + n >= total_size;
            let action = sink(&DownloadChunk {
                data: &buf[..n],
                offset,
                total_size,
                last,
            })?;
            offset += n;

            if action == ChunkAction::Abort {
                // Dropping the client tears the socket down.
                debug!("HTTP: transfer aborted by sink at {} bytes", offset);
                return Ok(());
            }
            if last {
                return Ok(());
            }
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn download(
        &mut self,
        url: &str,
        _headers: &[(&str, &str)],
        _timeout: Duration,
        _sink: &mut dyn FnMut(&DownloadChunk<'_>) -> Result<ChunkAction, OtaError>,
    ) -> Result<(), OtaError> {
        log::warn!("HTTP: no network backend in simulation, cannot fetch {}", url);
        Err(OtaError::Network)
    }
}
