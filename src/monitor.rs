//! Job monitoring: one control task per started job.
//!
//! The control task drives the job's status stream, publishes what it sees to
//! the job's [`StatusHub`], and on the first terminal event, poll failure or
//! stop request finalizes the session exactly once before tearing the job
//! down. The registry entry, and with it every subscription, lives exactly as
//! long as that task has not finished teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broadcast::{MonitorEvent, StatusHub, StatusSubscription};
use crate::config::Settings;
use crate::engine::EngineApi;
use crate::error::{EngineError, StartError};
use crate::poller::{status_stream, StatusSource};
use crate::pool::{ClientPool, EngineClient};
use crate::scanner::{self, ExploreKind, ScanRequest};
use crate::store::SessionStore;
use crate::types::{
    ClientKind, FullResults, JobHandle, MonitorKey, ScanMode, SessionId, SessionStatus,
    StatusSnapshot,
};

/// Grace period for control tasks to finish teardown on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Per-job monitoring switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Skip publishing a status equal to the previous one.
    pub distinct: bool,
    /// Remove the job's scan definition from the engine after stopping it.
    pub remove_on_done: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            distinct: true,
            remove_on_done: true,
        }
    }
}

struct MonitorEntry {
    handle: JobHandle,
    mode: ScanMode,
    hub: StatusHub,
    cancel: CancellationToken,
    finalized: AtomicBool,
}

impl MonitorEntry {
    /// True for exactly one caller.
    fn claim_finalize(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum Outcome {
    Completed(StatusSnapshot),
    PollFailed(String),
    Stopped,
}

struct Inner {
    pool: Arc<ClientPool>,
    store: Arc<dyn SessionStore>,
    settings: Settings,
    entries: Mutex<HashMap<MonitorKey, Arc<MonitorEntry>>>,
    tasks: TaskTracker,
}

/// Starts jobs and watches them until their results are persisted.
#[derive(Clone)]
pub struct JobMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMonitor")
            .field("active", &self.inner.entries().len())
            .finish_non_exhaustive()
    }
}

impl JobMonitor {
    pub fn new(pool: Arc<ClientPool>, store: Arc<dyn SessionStore>, settings: Settings) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                store,
                settings,
                entries: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.inner.pool
    }

    /// Start a job for `request` and monitor it on behalf of `session`.
    ///
    /// Spider jobs run on the shared client; every other mode gets its own
    /// exclusive client. A failed start leaves the session untouched, nothing
    /// registered and no exclusive client running.
    pub async fn start_and_monitor(
        &self,
        session: SessionId,
        url: &str,
        request: &ScanRequest,
        options: MonitorOptions,
    ) -> Result<JobHandle, StartError> {
        let pool = &self.inner.pool;
        let (handle, source) = match request {
            ScanRequest::Spider { config } => {
                let shared = pool.get_or_create_shared_client().await?;
                let handle = scanner::start_spider(pool, Some(shared.id()), url, config).await?;
                let source = StatusSource::Spider {
                    job_id: handle.job_id.clone(),
                };
                (handle, source)
            }
            ScanRequest::BrowserCrawl { config } => {
                let handle = scanner::start_browser_crawl(pool, None, url, config).await?;
                (handle, StatusSource::BrowserCrawl)
            }
            ScanRequest::Passive { explore } => {
                let job = scanner::start_passive(pool, url, explore).await?;
                (job.handle, StatusSource::Passive { inner: job.inner })
            }
            ScanRequest::Active { explore, config } => {
                let handle = scanner::start_active(
                    pool,
                    url,
                    explore,
                    config,
                    self.inner.settings.monitor.explore_settle,
                )
                .await?;
                let source = StatusSource::Active {
                    job_id: handle.job_id.clone(),
                };
                (handle, source)
            }
        };

        let Some(client) = pool.client(handle.client_id).await else {
            return Err(StartError::UnknownClient(handle.client_id));
        };
        if let Err(e) = self.monitor(session, handle.clone(), client.clone(), source, options) {
            if client.kind() == ClientKind::Exclusive {
                pool.release_client(client.id()).await;
            }
            return Err(e);
        }
        Ok(handle)
    }

    fn monitor(
        &self,
        session: SessionId,
        handle: JobHandle,
        client: Arc<EngineClient>,
        source: StatusSource,
        options: MonitorOptions,
    ) -> Result<(), StartError> {
        let mode = source.mode();
        let key = handle.key();
        let entry = {
            let mut entries = self.inner.entries();
            if entries.contains_key(&key) {
                warn!(job = %handle, "job is already monitored");
                return Err(StartError::AlreadyMonitored(handle));
            }
            let entry = Arc::new(MonitorEntry {
                handle: handle.clone(),
                mode,
                hub: StatusHub::new(
                    mode.initial_snapshot(),
                    self.inner.settings.monitor.hub_capacity,
                ),
                cancel: CancellationToken::new(),
                finalized: AtomicBool::new(false),
            });
            entries.insert(key.clone(), entry.clone());
            entry
        };

        let span = info_span!("monitor", job = %handle, %mode, %session);
        let inner = self.inner.clone();
        self.inner.tasks.spawn(
            async move {
                info!("monitoring started");
                inner
                    .run(key, entry, session, client, source, options)
                    .await;
            }
            .instrument(span),
        );
        Ok(())
    }

    /// A subscription to a monitored job, starting from its latest status.
    ///
    /// `None` when the job is not (or no longer) monitored.
    pub fn shared_status_stream(&self, handle: &JobHandle) -> Option<StatusSubscription> {
        self.inner
            .entries()
            .get(&handle.key())
            .map(|entry| entry.hub.subscribe())
    }

    /// Ask a monitored job to stop. Returns false if it is not monitored.
    pub fn signal_stop(&self, handle: &JobHandle) -> bool {
        match self.inner.entries().get(&handle.key()) {
            Some(entry) => {
                info!(job = %handle, "stop requested");
                entry.cancel.cancel();
                true
            }
            None => {
                warn!(job = %handle, "stop requested for a job that is not monitored");
                false
            }
        }
    }

    pub fn is_monitored(&self, handle: &JobHandle) -> bool {
        self.inner.entries().contains_key(&handle.key())
    }

    pub fn active_jobs(&self) -> Vec<(JobHandle, ScanMode)> {
        self.inner
            .entries()
            .values()
            .map(|e| (e.handle.clone(), e.mode))
            .collect()
    }

    /// Results gathered so far by a monitored job, skipping the first `offset`.
    ///
    /// `Ok(None)` when the job is not monitored. Passive jobs report the
    /// engine's alerts.
    pub async fn partial_results(
        &self,
        handle: &JobHandle,
        offset: usize,
    ) -> Result<Option<Vec<Value>>, EngineError> {
        let Some(mode) = self.inner.entries().get(&handle.key()).map(|e| e.mode) else {
            return Ok(None);
        };
        let Some(client) = self.inner.pool.client(handle.client_id).await else {
            return Ok(None);
        };
        let api = client.api();
        let items = match mode {
            ScanMode::Spider => api.spider_results(&handle.job_id).await?,
            ScanMode::BrowserCrawl => api.browser_results().await?,
            ScanMode::Passive => api.alerts().await?,
            ScanMode::Active => api.active_scan_progress(&handle.job_id).await?,
        };
        Ok(Some(items.into_iter().skip(offset).collect()))
    }

    /// Stop every monitored job, wait for their teardown, then release every
    /// client including the shared one.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.inner.entries().values().cloned().collect();
        info!(count = entries.len(), "stopping all monitored jobs");
        for entry in &entries {
            entry.cancel.cancel();
        }
        self.inner.tasks.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!("monitors did not finish teardown in time");
        }
        self.inner.pool.release_all_clients().await;
    }
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<MonitorKey, Arc<MonitorEntry>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn run(
        &self,
        key: MonitorKey,
        entry: Arc<MonitorEntry>,
        session: SessionId,
        client: Arc<EngineClient>,
        source: StatusSource,
        options: MonitorOptions,
    ) {
        let mut status = status_stream(client.api().clone(), source.clone(), self.settings.poll);
        let mut last: Option<StatusSnapshot> = None;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = entry.cancel.cancelled() => break Outcome::Stopped,
                next = status.next() => match next {
                    Some(Ok(snapshot)) => {
                        if entry.mode.is_terminal(&snapshot) {
                            break Outcome::Completed(snapshot);
                        }
                        if options.distinct && last.as_ref() == Some(&snapshot) {
                            continue;
                        }
                        debug!(?snapshot, "status");
                        last = Some(snapshot.clone());
                        entry.hub.publish(MonitorEvent::Status(snapshot));
                    }
                    Some(Err(e)) => break Outcome::PollFailed(e.to_string()),
                    None => break Outcome::PollFailed("status stream ended".into()),
                },
            }
        };
        drop(status);

        if entry.claim_finalize() {
            self.finalize(&entry, session, client.api(), &source, outcome)
                .await;
        }
        entry.cancel.cancel();
        self.teardown(&key, &entry, &client, &source, options).await;
    }

    async fn finalize(
        &self,
        entry: &MonitorEntry,
        session: SessionId,
        api: &EngineApi,
        source: &StatusSource,
        outcome: Outcome,
    ) {
        match outcome {
            Outcome::Completed(snapshot) => {
                info!("job finished, collecting results");
                self.persist_results(session, entry.mode, api, source).await;
                // subscribers see the terminal status only once results are stored
                entry.hub.publish(MonitorEvent::Status(snapshot));
            }
            Outcome::PollFailed(message) => {
                error!(%message, "status polling failed");
                self.set_status(session, SessionStatus::failed(message.clone()))
                    .await;
                entry.hub.publish(MonitorEvent::Failed { message });
            }
            Outcome::Stopped => {
                info!("job stopped before completion");
                self.set_status(
                    session,
                    SessionStatus::cancelled(format!("{} scan stopped on request", entry.mode)),
                )
                .await;
            }
        }
    }

    async fn persist_results(
        &self,
        session: SessionId,
        mode: ScanMode,
        api: &EngineApi,
        source: &StatusSource,
    ) {
        match fetch_full_results(api, source).await {
            Ok(results) => {
                if let Err(e) = self.store.create_full_results(session, mode, &results).await {
                    error!(error = %e, "failed to store full results");
                }
                self.set_status(session, SessionStatus::successful()).await;
            }
            Err(e) => {
                error!(error = %e, "failed to fetch full results");
                self.set_status(
                    session,
                    SessionStatus::failed(format!("failed to get {mode} full results: {e}")),
                )
                .await;
            }
        }
    }

    async fn set_status(&self, session: SessionId, status: SessionStatus) {
        if let Err(e) = self.store.update_session_status(session, status).await {
            error!(%session, error = %e, "failed to update session status");
        }
    }

    /// Stop the job at the engine, release an exclusive client, and drop the
    /// registry entry so subscriptions end.
    async fn teardown(
        &self,
        key: &MonitorKey,
        entry: &MonitorEntry,
        client: &EngineClient,
        source: &StatusSource,
        options: MonitorOptions,
    ) {
        if let Err(e) = stop_job(client.api(), source, options.remove_on_done).await {
            warn!(error = %e, "failed to stop job at the engine");
        }
        if client.kind() == ClientKind::Exclusive {
            self.pool.release_client(client.id()).await;
        }
        self.entries().remove(key);
        info!(job = %entry.handle, "monitoring finished");
    }
}

async fn fetch_full_results(
    api: &EngineApi,
    source: &StatusSource,
) -> Result<FullResults, EngineError> {
    match source {
        StatusSource::Spider { job_id } => api.spider_full_results(job_id).await,
        StatusSource::BrowserCrawl => api.browser_full_results().await,
        StatusSource::Passive { .. } | StatusSource::Active { .. } => Ok(FullResults::Alerts {
            alerts: api.alerts().await?,
            alerts_by_risk: api.alerts_by_risk().await?,
        }),
    }
}

async fn stop_job(
    api: &EngineApi,
    source: &StatusSource,
    remove: bool,
) -> Result<(), EngineError> {
    match source {
        StatusSource::Spider { job_id } => {
            api.spider_stop(job_id).await?;
            if remove {
                api.spider_remove_scan(job_id).await?;
            }
        }
        StatusSource::BrowserCrawl => api.browser_stop().await?,
        StatusSource::Passive { inner } => match inner.kind {
            ExploreKind::Spider => api.spider_stop(&inner.job_id).await?,
            ExploreKind::Browser => api.browser_stop().await?,
        },
        StatusSource::Active { job_id } => {
            api.active_stop(job_id).await?;
            if remove {
                api.active_remove_scan(job_id).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_distinct_and_remove() {
        let opts = MonitorOptions::default();
        assert!(opts.distinct);
        assert!(opts.remove_on_done);
    }

    #[test]
    fn finalize_is_claimed_once() {
        let entry = MonitorEntry {
            handle: JobHandle::single(crate::types::ClientId::new()),
            mode: ScanMode::BrowserCrawl,
            hub: StatusHub::new(ScanMode::BrowserCrawl.initial_snapshot(), 4),
            cancel: CancellationToken::new(),
            finalized: AtomicBool::new(false),
        };
        assert!(entry.claim_finalize());
        assert!(!entry.claim_finalize());
    }
}
