//! Typed engine operations on top of an [`EngineTransport`].

use std::sync::Arc;

use serde_json::Value;

use super::transport::{CallKind, EngineTransport};
use crate::error::EngineError;
use crate::scanner::{ActiveConfig, BrowserCrawlConfig, SpiderConfig};
use crate::types::{AlertsByRisk, CrawlState, FullResults, RiskGroup, RiskLevel};

const SPIDER: &str = "spider";
const BROWSER: &str = "ajaxSpider";
const PASSIVE: &str = "pscan";
const ACTIVE: &str = "ascan";
const CORE: &str = "core";
const ALERT: &str = "alert";

#[derive(Clone)]
pub struct EngineApi {
    transport: Arc<dyn EngineTransport>,
}

impl std::fmt::Debug for EngineApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineApi").finish_non_exhaustive()
    }
}

impl EngineApi {
    pub fn new(transport: Arc<dyn EngineTransport>) -> Self {
        Self { transport }
    }

    async fn view(
        &self,
        component: &str,
        name: &str,
        params: &[(&str, String)],
    ) -> Result<Value, EngineError> {
        self.transport
            .request(component, CallKind::View, name, params)
            .await
    }

    /// Run an action and require the engine's `OK` acknowledgement.
    async fn action(
        &self,
        component: &str,
        name: &str,
        params: &[(&str, String)],
    ) -> Result<(), EngineError> {
        let body = self
            .transport
            .request(component, CallKind::Action, name, params)
            .await?;
        match body.get("Result").and_then(Value::as_str) {
            Some("OK") => Ok(()),
            _ => Err(EngineError::rejected(format!("{component}/{name}"))),
        }
    }

    async fn action_value(
        &self,
        component: &str,
        name: &str,
        params: &[(&str, String)],
    ) -> Result<Value, EngineError> {
        self.transport
            .request(component, CallKind::Action, name, params)
            .await
    }

    // spider

    pub async fn spider_scan(&self, url: &str, config: &SpiderConfig) -> Result<String, EngineError> {
        let body = self
            .action_value(
                SPIDER,
                "scan",
                &[
                    ("url", url.to_owned()),
                    ("maxChildren", config.max_children.to_string()),
                    ("recurse", config.recurse.to_string()),
                    ("contextName", config.context_name.clone()),
                    ("subtreeOnly", config.subtree_only.to_string()),
                ],
            )
            .await?;
        Ok(str_field(&body, "spider/scan", "scan")?.to_owned())
    }

    pub async fn spider_status(&self, job_id: &str) -> Result<u8, EngineError> {
        let body = self.view(SPIDER, "status", &[("scanId", job_id.to_owned())]).await?;
        parse_percent(&body, "spider/status")
    }

    pub async fn spider_stop(&self, job_id: &str) -> Result<(), EngineError> {
        self.action(SPIDER, "stop", &[("scanId", job_id.to_owned())]).await
    }

    pub async fn spider_remove_scan(&self, job_id: &str) -> Result<(), EngineError> {
        self.action(SPIDER, "removeScan", &[("scanId", job_id.to_owned())])
            .await
    }

    pub async fn spider_results(&self, job_id: &str) -> Result<Vec<Value>, EngineError> {
        let body = self.view(SPIDER, "results", &[("scanId", job_id.to_owned())]).await?;
        array_field(&body, "spider/results", "results")
    }

    pub async fn spider_full_results(&self, job_id: &str) -> Result<FullResults, EngineError> {
        const OP: &str = "spider/fullResults";
        let body = self
            .view(SPIDER, "fullResults", &[("scanId", job_id.to_owned())])
            .await?;
        let parts = body
            .get("fullResults")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::malformed(OP, "missing fullResults"))?;
        // the engine returns one single-key object per url category
        let pick = |key: &str| -> Vec<Value> {
            parts
                .iter()
                .find_map(|p| p.get(key).and_then(Value::as_array).cloned())
                .unwrap_or_default()
        };
        Ok(FullResults::Spider {
            urls_in_scope: pick("urlsInScope"),
            urls_out_of_scope: pick("urlsOutOfScope"),
            urls_io_error: pick("urlsIoError"),
        })
    }

    // browser-driven crawl

    pub async fn browser_set_browser_id(&self, browser_id: &str) -> Result<(), EngineError> {
        self.action(BROWSER, "setOptionBrowserId", &[("String", browser_id.to_owned())])
            .await
    }

    pub async fn browser_set_number_of_browsers(&self, count: u32) -> Result<(), EngineError> {
        self.action(BROWSER, "setOptionNumberOfBrowsers", &[("Integer", count.to_string())])
            .await
    }

    pub async fn browser_set_max_crawl_depth(&self, depth: u32) -> Result<(), EngineError> {
        self.action(BROWSER, "setOptionMaxCrawlDepth", &[("Integer", depth.to_string())])
            .await
    }

    pub async fn browser_set_max_duration(&self, minutes: u32) -> Result<(), EngineError> {
        self.action(BROWSER, "setOptionMaxDuration", &[("Integer", minutes.to_string())])
            .await
    }

    pub async fn browser_scan(&self, url: &str, config: &BrowserCrawlConfig) -> Result<(), EngineError> {
        self.action(
            BROWSER,
            "scan",
            &[
                ("url", url.to_owned()),
                ("inScope", config.in_scope.to_string()),
                ("contextName", config.context_name.clone()),
                ("subtreeOnly", config.subtree_only.to_string()),
            ],
        )
        .await
    }

    pub async fn browser_status(&self) -> Result<CrawlState, EngineError> {
        const OP: &str = "ajaxSpider/status";
        let body = self.view(BROWSER, "status", &[]).await?;
        str_field(&body, OP, "status")?
            .parse()
            .map_err(|e: String| EngineError::malformed(OP, e))
    }

    pub async fn browser_stop(&self) -> Result<(), EngineError> {
        self.action(BROWSER, "stop", &[]).await
    }

    pub async fn browser_results(&self) -> Result<Vec<Value>, EngineError> {
        let body = self.view(BROWSER, "results", &[]).await?;
        array_field(&body, "ajaxSpider/results", "results")
    }

    pub async fn browser_full_results(&self) -> Result<FullResults, EngineError> {
        const OP: &str = "ajaxSpider/fullResults";
        let body = self.view(BROWSER, "fullResults", &[]).await?;
        let full = body
            .get("fullResults")
            .ok_or_else(|| EngineError::malformed(OP, "missing fullResults"))?;
        let pick = |key: &str| -> Vec<Value> {
            full.get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };
        Ok(FullResults::BrowserCrawl {
            in_scope: pick("inScope"),
            out_of_scope: pick("outOfScope"),
            errors: pick("errors"),
        })
    }

    // passive scanner

    pub async fn passive_set_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.action(PASSIVE, "setEnabled", &[("enabled", enabled.to_string())])
            .await
    }

    pub async fn passive_enable_all_scanners(&self) -> Result<(), EngineError> {
        self.action(PASSIVE, "enableAllScanners", &[]).await
    }

    pub async fn passive_enable_all_tags(&self) -> Result<(), EngineError> {
        self.action(PASSIVE, "enableAllTags", &[]).await
    }

    pub async fn passive_set_scan_only_in_scope(&self, only_in_scope: bool) -> Result<(), EngineError> {
        self.action(PASSIVE, "setScanOnlyInScope", &[("onlyInScope", only_in_scope.to_string())])
            .await
    }

    pub async fn passive_records_to_scan(&self) -> Result<u64, EngineError> {
        const OP: &str = "pscan/recordsToScan";
        let body = self.view(PASSIVE, "recordsToScan", &[]).await?;
        let raw = str_field(&body, OP, "recordsToScan")?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| EngineError::malformed(OP, format!("{raw}: {e}")))
    }

    // active scanner

    pub async fn active_enable_all_scanners(&self) -> Result<(), EngineError> {
        self.action(ACTIVE, "enableAllScanners", &[]).await
    }

    pub async fn active_scan(&self, url: &str, config: &ActiveConfig) -> Result<String, EngineError> {
        let body = self
            .action_value(
                ACTIVE,
                "scan",
                &[
                    ("url", url.to_owned()),
                    ("recurse", config.recurse.to_string()),
                    ("inScopeOnly", config.in_scope_only.to_string()),
                    ("scanPolicyName", config.scan_policy_name.clone()),
                    ("method", config.method.clone()),
                    ("postData", config.post_data.clone()),
                    ("contextId", config.context_id.clone()),
                ],
            )
            .await?;
        Ok(str_field(&body, "ascan/scan", "scan")?.to_owned())
    }

    pub async fn active_status(&self, job_id: &str) -> Result<u8, EngineError> {
        let body = self.view(ACTIVE, "status", &[("scanId", job_id.to_owned())]).await?;
        parse_percent(&body, "ascan/status")
    }

    pub async fn active_stop(&self, job_id: &str) -> Result<(), EngineError> {
        self.action(ACTIVE, "stop", &[("scanId", job_id.to_owned())]).await
    }

    pub async fn active_remove_scan(&self, job_id: &str) -> Result<(), EngineError> {
        self.action(ACTIVE, "removeScan", &[("scanId", job_id.to_owned())])
            .await
    }

    /// Per-host plugin progress of an active scan.
    pub async fn active_scan_progress(&self, job_id: &str) -> Result<Vec<Value>, EngineError> {
        const OP: &str = "ascan/scanProgress";
        let body = self
            .view(ACTIVE, "scanProgress", &[("scanId", job_id.to_owned())])
            .await?;
        let progress = body
            .get("scanProgress")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::malformed(OP, "missing scanProgress"))?;
        Ok(progress
            .iter()
            .find_map(|p| p.get("HostProcess").and_then(Value::as_array).cloned())
            .unwrap_or_default())
    }

    // core

    pub async fn alerts(&self) -> Result<Vec<Value>, EngineError> {
        let body = self.view(CORE, "alerts", &[]).await?;
        array_field(&body, "core/alerts", "alerts")
    }

    pub async fn alerts_by_risk(&self) -> Result<AlertsByRisk, EngineError> {
        const OP: &str = "alert/alertsByRisk";
        let body = self.view(ALERT, "alertsByRisk", &[]).await?;
        let buckets = body
            .get("alertsByRisk")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::malformed(OP, "missing alertsByRisk"))?;
        Ok(group_alerts_by_risk(buckets))
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.action(CORE, "shutdown", &[]).await
    }
}

/// Flatten `[{ "High": [{ "<alert>": [..] }, ..] }, ..]` into risk buckets.
/// Unknown risk names are skipped.
fn group_alerts_by_risk(buckets: &[Value]) -> AlertsByRisk {
    let mut out = AlertsByRisk::new();
    for bucket in buckets {
        let Some(obj) = bucket.as_object() else { continue };
        for (risk, groups) in obj {
            let Ok(level) = risk.parse::<RiskLevel>() else { continue };
            let entry = out.entry(level).or_default();
            for group in groups.as_array().into_iter().flatten() {
                if let Some((key, value)) = group.as_object().and_then(|g| g.iter().next()) {
                    entry.push(RiskGroup {
                        key: key.clone(),
                        value: value.as_array().cloned().unwrap_or_default(),
                    });
                }
            }
        }
    }
    out
}

fn str_field<'a>(body: &'a Value, op: &str, key: &str) -> Result<&'a str, EngineError> {
    body.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::malformed(op, format!("missing string field {key}")))
}

fn array_field(body: &Value, op: &str, key: &str) -> Result<Vec<Value>, EngineError> {
    body.get(key)
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| EngineError::malformed(op, format!("missing array field {key}")))
}

fn parse_percent(body: &Value, op: &str) -> Result<u8, EngineError> {
    let raw = str_field(body, op, "status")?;
    let val: u32 = raw
        .trim()
        .parse()
        .map_err(|e| EngineError::malformed(op, format!("{raw}: {e}")))?;
    Ok(val.min(100) as u8)
}
