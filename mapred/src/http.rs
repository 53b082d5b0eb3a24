//! Bucket transport: an axum server over the store and a reqwest-backed
//! fetch client.
//!
//! `GET /bucket/{dataset}/{source}/{split}` answers the framed record
//! stream as `application/octet-stream`. 404 means the bucket is unknown;
//! 410 means it was deleted. Consumers treat both (and connection failures)
//! as "producer must re-run".

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::codec::{Record, RecordReader};
use crate::error::{MrResult, TaskFailure};
use crate::serializer::Serializer;
use crate::store::BucketStore;
use crate::task::{DatasetId, InputFormat, InputSource};

/// Serve the store's buckets; returns the bound address. The store's base
/// URL is pointed at the bound address as a side effect.
pub async fn serve_buckets(
    store: Arc<BucketStore>,
    addr: SocketAddr,
) -> MrResult<(SocketAddr, JoinHandle<()>)> {
    let router = Router::new()
        .route("/bucket/:dataset/:source/:split", get(get_bucket))
        .with_state(Arc::clone(&store));

    let server = axum::Server::try_bind(&addr)?.serve(router.into_make_service());
    let bound = server.local_addr();
    store.set_base_url(bound);
    info!(addr = %bound, "bucket server listening");

    let handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            warn!(%err, "bucket server terminated");
        }
    });
    Ok((bound, handle))
}

async fn get_bucket(
    State(store): State<Arc<BucketStore>>,
    Path((dataset, source, split)): Path<(u64, u32, u32)>,
) -> Result<([(header::HeaderName, &'static str); 1], Vec<u8>), StatusCode> {
    let dataset = DatasetId::new(dataset);
    if store.is_dropped(dataset, source) {
        return Err(StatusCode::GONE);
    }
    let Some(path) = store.bucket_path(dataset, source, split) else {
        return Err(StatusCode::NOT_FOUND);
    };
    match tokio::fs::read(&path).await {
        Ok(body) => Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            warn!(%err, ?path, "failed to read bucket");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Why a fetch failed, from the consumer's point of view.
#[derive(Debug)]
pub enum FetchError {
    /// 404/410 or unreachable producer: the input is stale and the producer
    /// must re-run.
    Stale,
    Transport(crate::MrError),
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    /// Fetch a bucket's framed byte stream.
    pub async fn fetch_bucket(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|_| FetchError::Stale)?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(FetchError::Stale),
            status if !status.is_success() => {
                Err(FetchError::Transport(eyre!("bucket fetch returned {status}")))
            }
            _ => response
                .bytes()
                .await
                .map_err(|err| FetchError::Transport(err.into())),
        }
    }

    /// Fetch raw bytes from an input URL: http(s), file://, or a bare path.
    pub async fn fetch_raw(&self, url: &str) -> MrResult<Bytes> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self.client.get(url).send().await?;
            if !response.status().is_success() {
                bail!("fetching `{url}` returned {}", response.status());
            }
            return Ok(response.bytes().await?);
        }
        if let Ok(parsed) = url::Url::parse(url) {
            if parsed.scheme() == "file" {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| eyre!("invalid file url `{url}`"))?;
                return Ok(tokio::fs::read(path).await?.into());
            }
            bail!("unsupported url scheme `{}`", parsed.scheme());
        }
        // A bare filesystem path.
        Ok(tokio::fs::read(url).await?.into())
    }
}

/// Download and decode every record feeding one input column, in source
/// order. Key/value serializers apply to framed buckets only; line inputs
/// get line-number keys.
pub async fn fetch_records(
    fetcher: &Fetcher,
    inputs: &[InputSource],
    key_serializer: Option<&Serializer>,
    value_serializer: Option<&Serializer>,
) -> Result<Vec<Record>, TaskFailure> {
    let mut records = Vec::new();
    for input in inputs {
        match input.format {
            InputFormat::Lines => {
                let bytes = fetcher
                    .fetch_raw(&input.url)
                    .await
                    .map_err(|err| TaskFailure::Io(format!("{err:#}")))?;
                for (index, line) in split_lines(&bytes).enumerate() {
                    records.push((index.to_string().into_bytes(), line.to_vec()));
                }
            }
            InputFormat::Records => {
                let bytes = match fetcher.fetch_bucket(&input.url).await {
                    Ok(bytes) => bytes,
                    Err(FetchError::Stale) => {
                        return Err(TaskFailure::InputMissing {
                            dataset: input.dataset,
                            source: input.source,
                        })
                    }
                    Err(FetchError::Transport(err)) => {
                        return Err(TaskFailure::Io(format!("{err:#}")))
                    }
                };
                for record in RecordReader::new(Cursor::new(bytes)) {
                    let (mut key, mut value) =
                        record.map_err(|err| TaskFailure::Serialization(err.to_string()))?;
                    if let Some(s) = key_serializer {
                        key = s
                            .loads(&key)
                            .map_err(|err| TaskFailure::Serialization(format!("{err:#}")))?;
                    }
                    if let Some(s) = value_serializer {
                        value = s
                            .loads(&value)
                            .map_err(|err| TaskFailure::Serialization(format!("{err:#}")))?;
                    }
                    records.push((key, value));
                }
            }
        }
    }
    Ok(records)
}

fn split_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}
