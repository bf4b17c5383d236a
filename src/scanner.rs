//! Job starters, one per scan mode.
//!
//! Every starter either reuses a client named by the caller or spawns a fresh
//! exclusive one. A freshly spawned client is released again when any step of
//! the start fails, so a failed start never leaves an engine running.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{EngineError, StartError};
use crate::pool::{ClientPool, EngineClient};
use crate::types::{ClientId, JobHandle, ScanMode};

/// Options for the link-following spider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SpiderConfig {
    pub max_children: u32,
    pub recurse: bool,
    pub context_name: String,
    pub subtree_only: bool,
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            max_children: 1,
            recurse: true,
            context_name: String::new(),
            subtree_only: false,
        }
    }
}

/// Options for the headless-browser crawl.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserCrawlConfig {
    pub in_scope: bool,
    pub context_name: String,
    pub subtree_only: bool,
    pub max_crawl_depth: u32,
    /// Minutes.
    pub max_duration: u32,
    pub browser_id: String,
    pub browsers: u32,
}

impl Default for BrowserCrawlConfig {
    fn default() -> Self {
        Self {
            in_scope: false,
            context_name: String::new(),
            subtree_only: false,
            max_crawl_depth: 5,
            max_duration: 5,
            browser_id: "chrome-headless".into(),
            browsers: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ActiveConfig {
    pub recurse: bool,
    pub in_scope_only: bool,
    pub scan_policy_name: String,
    pub method: String,
    pub post_data: String,
    pub context_id: String,
}

impl Default for ActiveConfig {
    fn default() -> Self {
        Self {
            recurse: true,
            in_scope_only: false,
            scan_policy_name: String::new(),
            method: String::new(),
            post_data: String::new(),
            context_id: String::new(),
        }
    }
}

/// Crawl run ahead of a passive or active scan to fill the engine's traffic log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExploreConfig {
    Spider(SpiderConfig),
    Browser(BrowserCrawlConfig),
}

impl Default for ExploreConfig {
    fn default() -> Self {
        ExploreConfig::Spider(SpiderConfig::default())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExploreKind {
    Spider,
    Browser,
}

impl ExploreConfig {
    pub fn kind(&self) -> ExploreKind {
        match self {
            ExploreConfig::Spider(_) => ExploreKind::Spider,
            ExploreConfig::Browser(_) => ExploreKind::Browser,
        }
    }
}

/// A scan to start, with its mode-specific configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanRequest {
    Spider {
        #[serde(default)]
        config: SpiderConfig,
    },
    BrowserCrawl {
        #[serde(default)]
        config: BrowserCrawlConfig,
    },
    Passive {
        #[serde(default)]
        explore: ExploreConfig,
    },
    Active {
        #[serde(default)]
        explore: ExploreConfig,
        #[serde(default)]
        config: ActiveConfig,
    },
}

impl ScanRequest {
    pub fn mode(&self) -> ScanMode {
        match self {
            ScanRequest::Spider { .. } => ScanMode::Spider,
            ScanRequest::BrowserCrawl { .. } => ScanMode::BrowserCrawl,
            ScanRequest::Passive { .. } => ScanMode::Passive,
            ScanRequest::Active { .. } => ScanMode::Active,
        }
    }
}

/// The crawl started inside a passive scan, polled before the passive queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerCrawl {
    pub kind: ExploreKind,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassiveJob {
    pub handle: JobHandle,
    pub inner: InnerCrawl,
}

pub async fn start_spider(
    pool: &ClientPool,
    client_id: Option<ClientId>,
    url: &str,
    config: &SpiderConfig,
) -> Result<JobHandle, StartError> {
    let (client, fresh) = acquire(pool, client_id).await?;
    let result = async {
        let job_id = client.api().spider_scan(url, config).await?;
        Ok::<_, StartError>(JobHandle::new(client.id(), job_id))
    }
    .await;
    settle(pool, &client, fresh, ScanMode::Spider, result).await
}

pub async fn start_browser_crawl(
    pool: &ClientPool,
    client_id: Option<ClientId>,
    url: &str,
    config: &BrowserCrawlConfig,
) -> Result<JobHandle, StartError> {
    let (client, fresh) = acquire(pool, client_id).await?;
    let result = async {
        let api = client.api();
        step(api.browser_set_browser_id(&config.browser_id).await, "select crawl browser")?;
        step(
            api.browser_set_number_of_browsers(config.browsers).await,
            "set number of crawl browsers",
        )?;
        step(
            api.browser_set_max_crawl_depth(config.max_crawl_depth).await,
            "set max crawl depth",
        )?;
        step(
            api.browser_set_max_duration(config.max_duration).await,
            "set max crawl duration",
        )?;
        step(api.browser_scan(url, config).await, "start browser crawl")?;
        Ok::<_, StartError>(JobHandle::single(client.id()))
    }
    .await;
    settle(pool, &client, fresh, ScanMode::BrowserCrawl, result).await
}

/// Passive scan on a fresh exclusive client, fed by an inner crawl on that client.
pub async fn start_passive(
    pool: &ClientPool,
    url: &str,
    explore: &ExploreConfig,
) -> Result<PassiveJob, StartError> {
    let (client, fresh) = acquire(pool, None).await?;
    let result = async {
        let api = client.api();
        step(api.passive_set_enabled(true).await, "enable passive scan")?;
        step(api.passive_enable_all_scanners().await, "enable passive scanners")?;
        step(api.passive_enable_all_tags().await, "enable passive tags")?;
        step(
            api.passive_set_scan_only_in_scope(false).await,
            "disable passive in-scope-only",
        )?;
        let inner = start_explore(pool, &client, url, explore).await?;
        Ok::<_, StartError>(PassiveJob {
            handle: JobHandle::single(client.id()),
            inner,
        })
    }
    .await;
    settle(pool, &client, fresh, ScanMode::Passive, result).await
}

/// Active scan on a fresh exclusive client.
///
/// The active scan is issued `explore_settle` after the inner crawl starts.
pub async fn start_active(
    pool: &ClientPool,
    url: &str,
    explore: &ExploreConfig,
    config: &ActiveConfig,
    explore_settle: Duration,
) -> Result<JobHandle, StartError> {
    let (client, fresh) = acquire(pool, None).await?;
    let result = async {
        let api = client.api();
        step(api.active_enable_all_scanners().await, "enable active scanners")?;
        start_explore(pool, &client, url, explore).await?;
        tokio::time::sleep(explore_settle).await;
        let job_id = api.active_scan(url, config).await?;
        Ok::<_, StartError>(JobHandle::new(client.id(), job_id))
    }
    .await;
    settle(pool, &client, fresh, ScanMode::Active, result).await
}

async fn start_explore(
    pool: &ClientPool,
    client: &EngineClient,
    url: &str,
    explore: &ExploreConfig,
) -> Result<InnerCrawl, StartError> {
    let handle = match explore {
        ExploreConfig::Spider(cfg) => start_spider(pool, Some(client.id()), url, cfg).await?,
        ExploreConfig::Browser(cfg) => {
            start_browser_crawl(pool, Some(client.id()), url, cfg).await?
        }
    };
    Ok(InnerCrawl {
        kind: explore.kind(),
        job_id: handle.job_id,
    })
}

async fn acquire(
    pool: &ClientPool,
    client_id: Option<ClientId>,
) -> Result<(Arc<EngineClient>, bool), StartError> {
    match client_id {
        None => Ok((pool.new_exclusive_client().await?, true)),
        Some(id) => match pool.client(id).await {
            Some(client) => Ok((client, false)),
            None => {
                error!(client_id = %id, "start requested on unknown engine client");
                Err(StartError::UnknownClient(id))
            }
        },
    }
}

async fn settle<T>(
    pool: &ClientPool,
    client: &EngineClient,
    fresh: bool,
    mode: ScanMode,
    result: Result<T, StartError>,
) -> Result<T, StartError> {
    match result {
        Ok(v) => {
            info!(client_id = %client.id(), %mode, "scan started");
            Ok(v)
        }
        Err(e) => {
            error!(client_id = %client.id(), %mode, error = %e, "failed to start scan");
            if fresh {
                pool.release_client(client.id()).await;
            }
            Err(e)
        }
    }
}

/// A rejected precondition call aborts the start with the step that failed.
fn step(res: Result<(), EngineError>, what: &'static str) -> Result<(), StartError> {
    match res {
        Ok(()) => Ok(()),
        Err(EngineError::Rejected { .. }) => Err(StartError::Precondition { step: what }),
        Err(e) => Err(e.into()),
    }
}
