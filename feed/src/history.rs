//! Historical candle fetching against the backend-of-record, plus the
//! request ledger that keeps background refreshes and prefetch from issuing
//! the same range twice.

use crate::{Candle, ChannelKey, FeedError};

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Where historical candles come from. The production implementation is
/// [`HttpSource`]; tests inject their own.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// Fetch candles for `key` covering `[start, end]` seconds, ascending by
    /// time. Malformed rows are dropped before returning, never surfaced.
    async fn fetch_range(
        &self,
        key: ChannelKey,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>, FeedError>;
}

pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            request_timeout,
        }
    }
}

#[async_trait]
impl CandleSource for HttpSource {
    async fn fetch_range(
        &self,
        key: ChannelKey,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!(
            "{}/candles?symbol={}&granularity={}&start={}&end={}",
            self.base_url,
            key.symbol,
            key.granularity.as_secs(),
            start,
            end
        );

        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        let rows: Vec<Candle> =
            serde_json::from_str(&body).map_err(|e| FeedError::Parse(e.to_string()))?;

        Ok(sanitize_candles(rows, key))
    }
}

/// Drop malformed rows, then restore ascending unique times. The last
/// occurrence of a duplicated timestamp wins, matching the merge rule used
/// everywhere else in the pipeline.
fn sanitize_candles(rows: Vec<Candle>, key: ChannelKey) -> Vec<Candle> {
    let total = rows.len();
    let mut out: Vec<Candle> = Vec::with_capacity(total);

    for candle in rows {
        if let Some(reason) = candle.integrity_error() {
            log::warn!(
                "Dropping candle t={} for {}: {}",
                candle.time,
                key,
                reason
            );
            continue;
        }
        out.push(candle);
    }

    let sorted = out.windows(2).all(|w| w[0].time < w[1].time);
    if !sorted {
        out.sort_by_key(|c| c.time);
        out.dedup_by(|next, prev| {
            if next.time == prev.time {
                *prev = *next;
                true
            } else {
                false
            }
        });
        log::warn!("Historical response for {} needed reordering", key);
    }

    if out.len() < total {
        log::warn!("Dropped {} malformed rows for {}", total - out.len(), key);
    }
    out
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum RequestError {
    #[error("Request is already in flight")]
    InFlight,
    #[error("Request already failed: {0}")]
    Failed(String),
}

#[derive(PartialEq, Debug)]
enum RequestStatus {
    Pending,
    Completed(u64),
    Failed(String),
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct FetchRange {
    pub key: ChannelKey,
    pub start: i64,
    pub end: i64,
}

#[derive(PartialEq, Debug)]
struct FetchRequest {
    range: FetchRange,
    status: RequestStatus,
}

/// Ledger of historical fetches. A range identical to a pending one is
/// rejected, a recently completed one is skipped, and a completed one past
/// the retry cooldown may run again (covers data sources that answered with
/// stale or partial results).
pub struct RequestTracker {
    requests: HashMap<Uuid, FetchRequest>,
    retry_cooldown: Duration,
}

impl RequestTracker {
    pub fn new(retry_cooldown: Duration) -> Self {
        RequestTracker {
            requests: HashMap::new(),
            retry_cooldown,
        }
    }

    /// `Ok(Some(id))` means run the fetch under that id; `Ok(None)` means a
    /// fresh completion already covers it.
    pub fn add_request(&mut self, range: FetchRange) -> Result<Option<Uuid>, RequestError> {
        if let Some((existing_id, existing)) = self
            .requests
            .iter()
            .find(|(_, req)| req.range == range)
            .map(|(id, req)| (*id, req))
        {
            return match &existing.status {
                RequestStatus::Failed(error_msg) => Err(RequestError::Failed(error_msg.clone())),
                RequestStatus::Completed(ts) => {
                    let now = chrono::Utc::now().timestamp_millis() as u64;
                    if now.saturating_sub(*ts) >= self.retry_cooldown.as_millis() as u64 {
                        if let Some(req) = self.requests.get_mut(&existing_id) {
                            req.status = RequestStatus::Pending;
                        }
                        Ok(Some(existing_id))
                    } else {
                        Ok(None)
                    }
                }
                RequestStatus::Pending => Err(RequestError::InFlight),
            };
        }

        let id = Uuid::new_v4();
        self.requests.insert(
            id,
            FetchRequest {
                range,
                status: RequestStatus::Pending,
            },
        );
        Ok(Some(id))
    }

    pub fn mark_completed(&mut self, id: Uuid) {
        if let Some(request) = self.requests.get_mut(&id) {
            let timestamp = chrono::Utc::now().timestamp_millis() as u64;
            request.status = RequestStatus::Completed(timestamp);
        } else {
            log::warn!("Request not found: {:?}", id);
        }
    }

    pub fn mark_failed(&mut self, id: Uuid, error: String) {
        if let Some(request) = self.requests.get_mut(&id) {
            request.status = RequestStatus::Failed(error);
        } else {
            log::warn!("Request not found: {:?}", id);
        }
    }

    /// Forget everything, e.g. when the active target changes and old ranges
    /// no longer describe anything worth de-duplicating against.
    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Granularity, Symbol};

    fn range(start: i64, end: i64) -> FetchRange {
        FetchRange {
            key: ChannelKey::new(Symbol::new("BTC-USD"), Granularity::M1),
            start,
            end,
        }
    }

    #[test]
    fn pending_duplicate_is_rejected() {
        let mut tracker = RequestTracker::default();
        let id = tracker.add_request(range(0, 100)).unwrap();
        assert!(id.is_some());
        assert!(matches!(
            tracker.add_request(range(0, 100)),
            Err(RequestError::InFlight)
        ));
        // a different range is independent
        assert!(tracker.add_request(range(100, 200)).unwrap().is_some());
    }

    #[test]
    fn completed_request_is_skipped_within_cooldown() {
        let mut tracker = RequestTracker::new(Duration::from_secs(60));
        let id = tracker.add_request(range(0, 100)).unwrap().unwrap();
        tracker.mark_completed(id);
        assert_eq!(tracker.add_request(range(0, 100)).unwrap(), None);
    }

    #[test]
    fn completed_request_can_retry_after_cooldown() {
        let mut tracker = RequestTracker::new(Duration::ZERO);
        let id = tracker.add_request(range(0, 100)).unwrap().unwrap();
        tracker.mark_completed(id);
        // zero cooldown: immediately eligible again, same id reused
        assert_eq!(tracker.add_request(range(0, 100)).unwrap(), Some(id));
    }

    #[test]
    fn failed_request_reports_its_error() {
        let mut tracker = RequestTracker::default();
        let id = tracker.add_request(range(0, 100)).unwrap().unwrap();
        tracker.mark_failed(id, "boom".to_string());
        assert!(matches!(
            tracker.add_request(range(0, 100)),
            Err(RequestError::Failed(msg)) if msg == "boom"
        ));
    }

    #[test]
    fn clear_forgets_history() {
        let mut tracker = RequestTracker::default();
        let id = tracker.add_request(range(0, 100)).unwrap().unwrap();
        tracker.mark_failed(id, "boom".to_string());
        tracker.clear();
        assert!(tracker.add_request(range(0, 100)).unwrap().is_some());
    }

    #[test]
    fn sanitize_drops_and_reorders() {
        let key = ChannelKey::new(Symbol::new("BTC-USD"), Granularity::M1);
        let mk = |t: i64, close: f64| Candle {
            time: t,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        };
        let rows = vec![
            mk(120, 2.0),
            mk(60, 1.0),
            Candle {
                close: f64::NAN,
                ..mk(180, 3.0)
            },
            mk(120, 2.5),
        ];

        let cleaned = sanitize_candles(rows, key);
        assert_eq!(
            cleaned.iter().map(|c| c.time).collect::<Vec<_>>(),
            vec![60, 120]
        );
        // later duplicate wins
        assert_eq!(cleaned[1].close, 2.5);
    }
}
