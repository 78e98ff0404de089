// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.B Solr Client: a single HTTP call, gated on cluster health and
//! retried with a fixed sleep.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster_monitor::ClusterMonitor;
use crate::error::{CoreErrorKind, CoreResult};

/// The single operation the core needs from an HTTP client, seamed behind a
/// trait so tests can substitute a fake transport (§9 treats the
/// concrete HTTP stack as an implementation detail, not part of the
/// contract).
#[async_trait::async_trait]
pub trait SolrTransport: Send + Sync {
    async fn post(&self, url: &str, body: &serde_json::Value, timeout: Duration) -> CoreResult<()>;
}

pub struct ReqwestSolrTransport {
    client: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
}

impl ReqwestSolrTransport {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        ReqwestSolrTransport {
            client: reqwest::Client::builder()
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .expect("reqwest client builds with default TLS config"),
            username,
            password,
        }
    }
}

#[async_trait::async_trait]
impl SolrTransport for ReqwestSolrTransport {
    async fn post(&self, url: &str, body: &serde_json::Value, timeout: Duration) -> CoreResult<()> {
        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Connection", "keep-alive")
            .timeout(timeout)
            .json(body);
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.clone());
        }
        let response = request.send().await?;
        if response.status().as_u16() >= 300 {
            return Err(CoreErrorKind::TransientIo.with_error(anyhow::anyhow!(
                "solr update returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

pub struct SolrClient {
    update_url: String,
    transport: Arc<dyn SolrTransport>,
    cluster_monitor: Arc<ClusterMonitor>,
    max_update_tries: u32,
    update_retry_wait: Duration,
}

impl SolrClient {
    pub fn new(
        update_url: String,
        transport: Arc<dyn SolrTransport>,
        cluster_monitor: Arc<ClusterMonitor>,
        max_update_tries: u32,
        update_retry_wait: Duration,
    ) -> Self {
        SolrClient {
            update_url,
            transport,
            cluster_monitor,
            max_update_tries,
            update_retry_wait,
        }
    }

    /// Sends `body` to `update_url`, retrying transport errors and HTTP >=
    /// 300 up to `max_update_tries` times with a fixed sleep in between.
    /// Before every attempt the call blocks on the cluster monitor and
    /// fails fast if the cluster stays `error` beyond the retry budget.
    pub async fn request(&self, body: serde_json::Value, timeout: Duration) -> CoreResult<()> {
        let mut last_err = None;
        for attempt in 1..=self.max_update_tries.max(1) {
            if !self.cluster_monitor.wait_until_ok(self.max_update_tries).await {
                return Err(CoreErrorKind::ClusterUnreachable
                    .with_error(anyhow::anyhow!("cluster stayed in error state")));
            }
            match self.transport.post(&self.update_url, &body, timeout).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, max = self.max_update_tries, error = %err, "solr-update-failed");
                    last_err = Some(err);
                    if attempt < self.max_update_tries {
                        tokio::time::sleep(self.update_retry_wait).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            CoreErrorKind::TransientIo.with_error(anyhow::anyhow!("solr update exhausted retries"))
        }))
    }

    pub async fn commit(&self, timeout: Duration) -> CoreResult<()> {
        info!("solr-commit");
        self.request(serde_json::json!({"commit": {}}), timeout).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::cluster_monitor::{ClusterMonitor, ClusterState, ClusterStateProbe};

    struct FlakyTransport {
        fail_times: u32,
        calls: AtomicU32,
        sleeps_observed: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl SolrTransport for FlakyTransport {
        async fn post(&self, _url: &str, _body: &serde_json::Value, _timeout: Duration) -> CoreResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(CoreErrorKind::TransientIo.with_error(anyhow::anyhow!("HTTP 500")));
            }
            Ok(())
        }
    }

    fn always_ok_monitor() -> Arc<ClusterMonitor> {
        Arc::new(ClusterMonitor::new(None, 0))
    }

    #[tokio::test]
    async fn retries_then_succeeds_within_budget() {
        let transport = Arc::new(FlakyTransport {
            fail_times: 2,
            calls: AtomicU32::new(0),
            sleeps_observed: Mutex::new(0),
        });
        let client = SolrClient::new(
            "http://x/update".to_string(),
            transport.clone(),
            always_ok_monitor(),
            5,
            Duration::from_millis(1),
        );
        client
            .request(serde_json::json!([]), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_retries_propagates_error() {
        let transport = Arc::new(FlakyTransport {
            fail_times: 10,
            calls: AtomicU32::new(0),
            sleeps_observed: Mutex::new(0),
        });
        let client = SolrClient::new(
            "http://x/update".to_string(),
            transport.clone(),
            always_ok_monitor(),
            3,
            Duration::from_millis(1),
        );
        let result = client.request(serde_json::json!([]), Duration::from_secs(1)).await;
        assert!(result.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    struct AlwaysErrorProbe;
    #[async_trait::async_trait]
    impl ClusterStateProbe for AlwaysErrorProbe {
        async fn probe(&self) -> ClusterState {
            ClusterState::Error
        }
    }

    #[tokio::test]
    async fn fails_fast_when_cluster_unreachable() {
        let transport = Arc::new(FlakyTransport {
            fail_times: 0,
            calls: AtomicU32::new(0),
            sleeps_observed: Mutex::new(0),
        });
        let monitor = Arc::new(ClusterMonitor::new(Some(Box::new(AlwaysErrorProbe)), 1));
        let client = SolrClient::new(
            "http://x/update".to_string(),
            transport.clone(),
            monitor,
            2,
            Duration::from_millis(1),
        );
        let result = client.request(serde_json::json!([]), Duration::from_secs(1)).await;
        assert!(result.is_err());
        // The gate must prevent any HTTP call from leaving the client while degraded/error.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
