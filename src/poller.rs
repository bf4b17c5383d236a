//! Cold status streams.
//!
//! Every call to [`status_stream`] starts its own independent poll loop: a
//! first query after `delay`, then one query per `interval`. A tick whose
//! query still fails after `max_retries` extra attempts ends the stream with
//! an error item.

use std::future::Future;
use std::pin::Pin;

use async_stream::stream;
use futures::Stream;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::PollSettings;
use crate::engine::EngineApi;
use crate::error::{EngineError, PollError};
use crate::scanner::{ExploreKind, InnerCrawl};
use crate::types::{CrawlState, ScanMode, StatusSnapshot};

pub type StatusStream = Pin<Box<dyn Stream<Item = Result<StatusSnapshot, PollError>> + Send>>;

/// What a job's status stream queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSource {
    Spider { job_id: String },
    BrowserCrawl,
    /// Inner crawl progress first, then the passive scanner's queue.
    Passive { inner: InnerCrawl },
    Active { job_id: String },
}

impl StatusSource {
    pub fn mode(&self) -> ScanMode {
        match self {
            StatusSource::Spider { .. } => ScanMode::Spider,
            StatusSource::BrowserCrawl => ScanMode::BrowserCrawl,
            StatusSource::Passive { .. } => ScanMode::Passive,
            StatusSource::Active { .. } => ScanMode::Active,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StatusQuery<'a> {
    Spider(&'a str),
    Browser,
    PassiveQueue,
    Active(&'a str),
}

impl StatusQuery<'_> {
    fn label(self) -> &'static str {
        match self {
            StatusQuery::Spider(_) => "spider status",
            StatusQuery::Browser => "browser crawl status",
            StatusQuery::PassiveQueue => "passive records to scan",
            StatusQuery::Active(_) => "active scan status",
        }
    }
}

async fn query(api: &EngineApi, target: StatusQuery<'_>) -> Result<StatusSnapshot, EngineError> {
    Ok(match target {
        StatusQuery::Spider(job_id) => StatusSnapshot::Progress {
            percent: api.spider_status(job_id).await?,
        },
        StatusQuery::Browser => StatusSnapshot::Crawl {
            state: api.browser_status().await?,
        },
        StatusQuery::PassiveQueue => StatusSnapshot::Explored {
            records_to_scan: api.passive_records_to_scan().await?,
        },
        StatusQuery::Active(job_id) => StatusSnapshot::Progress {
            percent: api.active_status(job_id).await?,
        },
    })
}

fn crawl_finished(snapshot: &StatusSnapshot) -> bool {
    match snapshot {
        StatusSnapshot::Progress { percent } => *percent >= 100,
        StatusSnapshot::Crawl { state } => *state == CrawlState::Stopped,
        StatusSnapshot::Explored { .. } => true,
    }
}

/// Run `op` until it succeeds or has failed `1 + max_retries` times.
pub async fn query_with_retry<F, Fut, T>(
    what: &'static str,
    poll: &PollSettings,
    mut op: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt > poll.max_retries {
                    return Err(PollError {
                        what,
                        attempts: attempt,
                        last: e,
                    });
                }
                debug!(
                    attempt,
                    max_retries = poll.max_retries,
                    error = %e,
                    "retrying {what}"
                );
                if !poll.retry_backoff.is_zero() {
                    time::sleep(poll.retry_backoff).await;
                }
            }
        }
    }
}

/// A new, independent poll sequence for `source`.
pub fn status_stream(api: EngineApi, source: StatusSource, poll: PollSettings) -> StatusStream {
    Box::pin(stream! {
        let mut ticker = time::interval_at(Instant::now() + poll.delay, poll.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut explored = false;

        loop {
            ticker.tick().await;
            let target = match &source {
                StatusSource::Spider { job_id } => StatusQuery::Spider(job_id),
                StatusSource::BrowserCrawl => StatusQuery::Browser,
                StatusSource::Active { job_id } => StatusQuery::Active(job_id),
                StatusSource::Passive { .. } if explored => StatusQuery::PassiveQueue,
                StatusSource::Passive { inner } => match inner.kind {
                    ExploreKind::Spider => StatusQuery::Spider(&inner.job_id),
                    ExploreKind::Browser => StatusQuery::Browser,
                },
            };

            let api_ref = &api;
            match query_with_retry(target.label(), &poll, move || query(api_ref, target)).await {
                Ok(snapshot) => {
                    if matches!(source, StatusSource::Passive { .. }) && !explored {
                        explored = crawl_finished(&snapshot);
                    }
                    yield Ok(snapshot);
                }
                Err(e) => {
                    warn!(error = %e, "status polling gave up");
                    yield Err(e);
                    break;
                }
            }
        }
    })
}
