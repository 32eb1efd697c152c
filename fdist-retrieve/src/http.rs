// Copyright 2024-Present the fdist maintainers
// SPDX-License-Identifier: Apache-2.0

//! The HTTP side of a retrieve directory: one GET for the listing, one
//! HEAD per file whose size or date the listing left unknown.

use crate::dates::parse_listing_date;
use crate::planner::{PlanError, RemoteDir};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, warn};

/// Refuse to buffer listings beyond this; a remote index larger than
/// this is almost certainly not a directory listing.
pub const MAX_HTTP_DIR_BUFFER: usize = 4 * 1024 * 1024;

pub struct HttpDirSource {
    client: Client<HttpConnector, Empty<Bytes>>,
    base: Uri,
    timeout: Duration,
}

impl HttpDirSource {
    /// `base` is the directory URL, e.g. `http://host:port/data/`.
    pub fn new(base: Uri, timeout: Duration) -> HttpDirSource {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(HttpConnector::new());
        HttpDirSource {
            client,
            base,
            timeout,
        }
    }

    fn file_uri(&self, name: &str) -> Result<Uri, PlanError> {
        let base = self.base.to_string();
        let joined = if base.ends_with('/') {
            format!("{base}{name}")
        } else {
            format!("{base}/{name}")
        };
        joined
            .parse()
            .map_err(|err| PlanError::Fetch(format!("bad file uri {joined}: {err}")))
    }

    async fn send(&self, request: Request<Empty<Bytes>>) -> Result<hyper::Response<hyper::body::Incoming>, PlanError> {
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| PlanError::Fetch("request timed out".to_string()))?
            .map_err(|err| PlanError::Fetch(err.to_string()))?;
        Ok(response)
    }
}

impl RemoteDir for HttpDirSource {
    /// GET the listing. Both fixed Content-Length and chunked bodies are
    /// consumed, bounded by `MAX_HTTP_DIR_BUFFER`.
    async fn list(&mut self) -> Result<String, PlanError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.base.clone())
            .body(Empty::new())
            .map_err(|err| PlanError::Fetch(err.to_string()))?;
        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PlanError::Fetch(format!("listing returned {status}")));
        }
        if let Some(length) = content_length(&response) {
            if length as usize > MAX_HTTP_DIR_BUFFER {
                warn!(
                    "directory buffer is only {MAX_HTTP_DIR_BUFFER} bytes, remote \
                     system wants to send {length} bytes"
                );
                return Err(PlanError::Fetch("listing too large".to_string()));
            }
        }

        let mut body = response.into_body();
        let mut buffered: Vec<u8> = Vec::new();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|err| PlanError::Fetch(err.to_string()))?;
            if let Some(data) = frame.data_ref() {
                if buffered.len() + data.len() > MAX_HTTP_DIR_BUFFER {
                    warn!(
                        "directory buffer is only {MAX_HTTP_DIR_BUFFER} bytes, \
                         remote listing keeps growing"
                    );
                    return Err(PlanError::Fetch("listing too large".to_string()));
                }
                buffered.extend_from_slice(data);
            }
        }
        String::from_utf8(buffered)
            .map_err(|_| PlanError::Fetch("listing body is not valid UTF-8".to_string()))
    }

    /// HEAD one file for its size and mtime. A 404 is not fatal for the
    /// scan; the entry simply keeps its unknowns.
    async fn head(&mut self, name: &str) -> Result<(Option<i64>, Option<i64>), PlanError> {
        let request = Request::builder()
            .method(Method::HEAD)
            .uri(self.file_uri(name)?)
            .body(Empty::new())
            .map_err(|err| PlanError::Fetch(err.to_string()))?;
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("HEAD {name}: gone between listing and probe");
            return Ok((None, None));
        }
        if !response.status().is_success() {
            return Err(PlanError::Fetch(format!(
                "HEAD {name} returned {}",
                response.status()
            )));
        }
        let size = content_length(&response).map(|length| length as i64);
        let mtime = response
            .headers()
            .get(hyper::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_listing_date);
        Ok((size, mtime))
    }
}

fn content_length<B>(response: &hyper::Response<B>) -> Option<u64> {
    response
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_list_fetches_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/data/");
            then.status(200)
                .body("<h1>Index of /data</h1><PRE><a href=\"x\">x</a>  1K\n</PRE>");
        });

        let mut source = HttpDirSource::new(
            server.url("/data/").parse().unwrap(),
            Duration::from_secs(5),
        );
        let body = source.list().await.unwrap();
        mock.assert();
        assert!(body.contains("Index of /data"));
    }

    #[tokio::test]
    async fn test_list_rejects_oversized_content_length() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/big/");
            then.status(200)
                .header("content-length", (MAX_HTTP_DIR_BUFFER + 1).to_string())
                .body("x");
        });

        let mut source = HttpDirSource::new(
            server.url("/big/").parse().unwrap(),
            Duration::from_secs(5),
        );
        assert!(matches!(source.list().await, Err(PlanError::Fetch(_))));
    }

    #[tokio::test]
    async fn test_list_http_error_is_surfaced() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/denied/");
            then.status(403);
        });

        let mut source = HttpDirSource::new(
            server.url("/denied/").parse().unwrap(),
            Duration::from_secs(5),
        );
        match source.list().await {
            Err(PlanError::Fetch(reason)) => assert!(reason.contains("403")),
            other => panic!("expected Fetch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_head_reads_size_and_date() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("HEAD").path("/data/file.dat");
            then.status(200)
                .header("content-length", "5120")
                .header("last-modified", "Wed, 01 Jan 2020 12:00:00 GMT");
        });

        let mut source = HttpDirSource::new(
            server.url("/data/").parse().unwrap(),
            Duration::from_secs(5),
        );
        let (size, mtime) = source.head("file.dat").await.unwrap();
        mock.assert();
        assert_eq!(size, Some(5120));
        assert!(mtime.is_some());
    }

    #[tokio::test]
    async fn test_head_missing_file_keeps_unknowns() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("HEAD").path("/data/vanished");
            then.status(404);
        });

        let mut source = HttpDirSource::new(
            server.url("/data/").parse().unwrap(),
            Duration::from_secs(5),
        );
        assert_eq!(source.head("vanished").await.unwrap(), (None, None));
    }
}
