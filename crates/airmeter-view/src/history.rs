//! Paginated history fetches, anchored at each publisher's earliest-known
//! reading and cached per cursor.

use crate::store::Store;
use airmeter_core::{Cursor, PublisherId, Reading};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const READINGS_PATH: &str = "sensors/readings";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no API address configured")]
    NoApiAddress,
    #[error("invalid API address: {0}")]
    InvalidAddress(String),
    #[error("page size must be at least 1")]
    InvalidLimit,
    #[error("no reading seen yet for publisher {0}")]
    NoAnchor(PublisherId),
    #[error("history request returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("history request failed: {0}")]
    Request(String),
    #[error("history response is not a reading list: {0}")]
    Decode(String),
}

/// Source of historical readings. Implementations return at most `limit`
/// readings strictly older than `before`, oldest first.
#[async_trait]
pub trait ReadingSource: Send + Sync {
    async fn readings_before(
        &self,
        publisher: PublisherId,
        before: u64,
        limit: u16,
    ) -> Result<Vec<Reading>, FetchError>;
}

/// `GET {api}sensors/readings?pub_id=..&before=..&limit=..`
#[derive(Debug, Clone)]
pub struct HttpReadingSource {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpReadingSource {
    pub fn new(api_base: &Url) -> Result<Self, FetchError> {
        Self::with_client(reqwest::Client::new(), api_base)
    }

    pub fn with_client(client: reqwest::Client, api_base: &Url) -> Result<Self, FetchError> {
        let mut base = api_base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join(READINGS_PATH)
            .map_err(|err| FetchError::InvalidAddress(err.to_string()))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl ReadingSource for HttpReadingSource {
    async fn readings_before(
        &self,
        publisher: PublisherId,
        before: u64,
        limit: u16,
    ) -> Result<Vec<Reading>, FetchError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .header(ACCEPT, "application/json")
            .query(&[
                ("pub_id", publisher.0.to_string()),
                ("before", before.to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await
            .map_err(|err| FetchError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<Vec<Reading>>()
            .await
            .map_err(|err| FetchError::Decode(err.to_string()))
    }
}

/// One page of history as returned by [`HistoryFetcher::fetch_page`].
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub cursor: Cursor,
    pub readings: Vec<Reading>,
    /// Served from the window cache without a request.
    pub cached: bool,
}

/// Fetches currently waiting on the source, per cursor. Shared by clones.
type InFlightCounts = Arc<Mutex<HashMap<Cursor, usize>>>;

#[derive(Clone)]
pub struct HistoryFetcher {
    store: Arc<Store>,
    source: Option<Arc<dyn ReadingSource>>,
    in_flight: InFlightCounts,
}

/// Marks one request for `cursor` as in flight until dropped.
struct InFlight<'a> {
    fetcher: &'a HistoryFetcher,
    cursor: Cursor,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.fetcher.finish_fetch(self.cursor);
    }
}

impl HistoryFetcher {
    pub fn new(store: Arc<Store>, source: Option<Arc<dyn ReadingSource>>) -> Self {
        Self {
            store,
            source,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetcher backed by the HTTP API, or one that always reports
    /// [`FetchError::NoApiAddress`] when no address is configured.
    pub fn from_api(store: Arc<Store>, api_base: Option<&Url>) -> Result<Self, FetchError> {
        let source = match api_base {
            Some(base) => Some(Arc::new(HttpReadingSource::new(base)?) as Arc<dyn ReadingSource>),
            None => None,
        };
        Ok(Self::new(store, source))
    }

    /// Fetches up to `limit` readings older than anything known for
    /// `publisher`. A page already cached under the same cursor is returned
    /// without a request. On failure the store is left as it was, except
    /// that the cursor stays tracked while another fetch for it is pending.
    pub async fn fetch_page(&self, publisher: PublisherId, limit: u16) -> Result<Page, FetchError> {
        let source = self.source.as_ref().ok_or(FetchError::NoApiAddress)?;
        let before = self.anchor(publisher, limit)?;
        let cursor = Cursor::page(publisher, before, limit);

        if let Some(readings) = self.store.windows().get(&cursor) {
            debug!("history_cache_hit: {cursor}");
            return Ok(Page {
                cursor,
                readings,
                cached: true,
            });
        }

        let in_flight = self.start_fetch(cursor);
        let readings = match source.readings_before(publisher, before, limit).await {
            Ok(readings) => readings,
            Err(err) => {
                drop(in_flight);
                warn!("history_fetch_failed: {cursor}: {err}");
                return Err(err);
            }
        };

        if let Some(oldest) = readings.first().map(|reading| reading.read_time) {
            self.store.earliest().update(&publisher, |earliest| match earliest {
                Some(current) if *current <= oldest => false,
                _ => {
                    *earliest = Some(oldest);
                    true
                }
            });
        }
        self.store
            .cursors()
            .update(&publisher, |cursors| cursors.insert(cursor));
        self.store.windows().set(&cursor, Some(readings.clone()));
        drop(in_flight);
        info!("history_page: {cursor} readings={}", readings.len());
        Ok(Page {
            cursor,
            readings,
            cached: false,
        })
    }

    fn start_fetch(&self, cursor: Cursor) -> InFlight<'_> {
        let mut in_flight = self.lock_in_flight();
        *in_flight.entry(cursor).or_insert(0) += 1;
        self.store
            .cursors()
            .update(&cursor.publisher, |cursors| cursors.insert(cursor));
        InFlight {
            fetcher: self,
            cursor,
        }
    }

    /// The cursor leaves the set only once no fetch for it is pending and
    /// none of them populated its window.
    fn finish_fetch(&self, cursor: Cursor) {
        let mut in_flight = self.lock_in_flight();
        let remaining = match in_flight.get_mut(&cursor) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }
        in_flight.remove(&cursor);
        if self.store.windows().get(&cursor).is_none() {
            self.store
                .cursors()
                .update(&cursor.publisher, |cursors| cursors.remove(&cursor));
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<Cursor, usize>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn anchor(&self, publisher: PublisherId, limit: u16) -> Result<u64, FetchError> {
        if limit == 0 {
            return Err(FetchError::InvalidLimit);
        }
        self.store
            .earliest()
            .get(&publisher)
            .ok_or(FetchError::NoAnchor(publisher))
    }

    /// Walks back up to `pages` pages, stopping early once the source
    /// returns a short page.
    pub async fn fetch_earlier(
        &self,
        publisher: PublisherId,
        limit: u16,
        pages: usize,
    ) -> Result<Vec<Page>, FetchError> {
        let mut fetched = Vec::new();
        for _ in 0..pages {
            let page = self.fetch_page(publisher, limit).await?;
            let exhausted = page.readings.len() < usize::from(limit);
            fetched.push(page);
            if exhausted {
                break;
            }
        }
        Ok(fetched)
    }
}
