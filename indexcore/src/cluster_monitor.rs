// Copyright (C) 2024 RecordManager-rs contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

//! §4.C Cluster Monitor: periodic SolrCloud state probe, caching, and
//! classification into `ok` / `degraded` / `error`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::warn;

const NORMAL_SHARD_STATES: &[&str] = &["active", "inactive", "construction"];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ClusterState {
    Ok,
    Degraded,
    Error,
}

#[async_trait::async_trait]
pub trait ClusterStateProbe: Send + Sync {
    /// Fetches and classifies the cluster state. Any transport or decode
    /// failure must be surfaced as `Ok(ClusterState::Error)` rather than an
    /// `Err`, per §4.C ("the probe fails ... `error`").
    async fn probe(&self) -> ClusterState;
}

#[derive(Debug, Deserialize)]
struct ClusterStateJson {
    #[serde(default)]
    znode: Option<ZnodeJson>,
}

#[derive(Debug, Deserialize)]
struct ZnodeJson {
    data: String,
}

#[derive(Debug, Deserialize)]
struct ClusterStateData {
    #[serde(default)]
    collections: std::collections::HashMap<String, CollectionJson>,
}

#[derive(Debug, Deserialize)]
struct CollectionJson {
    #[serde(default)]
    shards: std::collections::HashMap<String, ShardJson>,
}

#[derive(Debug, Deserialize)]
struct ShardJson {
    #[serde(default)]
    state: String,
    #[serde(default)]
    replicas: std::collections::HashMap<String, ReplicaJson>,
}

#[derive(Debug, Deserialize)]
struct ReplicaJson {
    #[serde(default)]
    state: String,
}

fn classify(data: &ClusterStateData) -> ClusterState {
    for collection in data.collections.values() {
        for shard in collection.shards.values() {
            if !NORMAL_SHARD_STATES.contains(&shard.state.as_str()) {
                return ClusterState::Degraded;
            }
            for replica in shard.replicas.values() {
                if replica.state != "active" {
                    return ClusterState::Degraded;
                }
            }
        }
    }
    ClusterState::Ok
}

/// Probes `<admin_url>/zookeeper?wt=json&detail=true&path=%2Fclusterstate.json&view=graph`
/// over HTTP.
pub struct HttpClusterStateProbe {
    admin_url: String,
    client: reqwest::Client,
}

impl HttpClusterStateProbe {
    pub fn new(admin_url: String, client: reqwest::Client) -> Self {
        HttpClusterStateProbe { admin_url, client }
    }
}

#[async_trait::async_trait]
impl ClusterStateProbe for HttpClusterStateProbe {
    async fn probe(&self) -> ClusterState {
        let url = format!(
            "{}/zookeeper?wt=json&detail=true&path=%2Fclusterstate.json&view=graph",
            self.admin_url.trim_end_matches('/')
        );
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(err) => {
                warn!(error = %err, "cluster-probe-transport-error");
                return ClusterState::Error;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "cluster-probe-non-200");
            return ClusterState::Error;
        }
        let body: ClusterStateJson = match response.json().await {
            Ok(b) => b,
            Err(err) => {
                warn!(error = %err, "cluster-probe-undecodable");
                return ClusterState::Error;
            }
        };
        let Some(znode) = body.znode else {
            return ClusterState::Error;
        };
        match serde_json::from_str::<ClusterStateData>(&znode.data) {
            Ok(data) => classify(&data),
            Err(err) => {
                warn!(error = %err, "cluster-probe-undecodable-znode-data");
                ClusterState::Error
            }
        }
    }
}

/// Caches the last classification for at least `check_interval`. Always
/// reports `ok` when disabled (`check_interval <= 0` or no admin url),
/// matching §4.C's short-circuit.
pub struct ClusterMonitor {
    probe: Option<Box<dyn ClusterStateProbe>>,
    check_interval: Duration,
    cached: Mutex<Option<(ClusterState, Instant)>>,
}

impl ClusterMonitor {
    pub fn new(probe: Option<Box<dyn ClusterStateProbe>>, check_interval_secs: i64) -> Self {
        ClusterMonitor {
            probe,
            check_interval: Duration::from_secs(check_interval_secs.max(0) as u64),
            cached: Mutex::new(None),
        }
    }

    pub fn disabled(&self) -> bool {
        self.probe.is_none() || self.check_interval.is_zero()
    }

    pub async fn current_state(&self) -> ClusterState {
        if self.disabled() {
            return ClusterState::Ok;
        }
        let now = Instant::now();
        {
            let cached = self.cached.lock().unwrap();
            if let Some((state, at)) = *cached {
                if now.duration_since(at) < self.check_interval {
                    return state;
                }
            }
        }
        let state = self.probe.as_ref().unwrap().probe().await;
        *self.cached.lock().unwrap() = Some((state, now));
        state
    }

    /// Blocks (polling on `check_interval`) until the cluster is `ok`,
    /// returning `false` if it stays `error` for `max_tries` consecutive
    /// observations (§4.C "Observers ... give up after
    /// `max_update_tries` consecutive `error` outcomes").
    pub async fn wait_until_ok(&self, max_tries: u32) -> bool {
        let mut consecutive_errors = 0u32;
        loop {
            match self.current_state().await {
                ClusterState::Ok => return true,
                ClusterState::Degraded => {
                    consecutive_errors = 0;
                    tokio::time::sleep(self.check_interval.max(Duration::from_millis(1))).await;
                }
                ClusterState::Error => {
                    consecutive_errors += 1;
                    if consecutive_errors >= max_tries {
                        return false;
                    }
                    tokio::time::sleep(self.check_interval.max(Duration::from_millis(1))).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProbe {
        states: Vec<ClusterState>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClusterStateProbe for ScriptedProbe {
        async fn probe(&self) -> ClusterState {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.states.get(i).copied().unwrap_or(ClusterState::Error)
        }
    }

    #[tokio::test]
    async fn disabled_monitor_always_ok() {
        let monitor = ClusterMonitor::new(None, 30);
        assert_eq!(monitor.current_state().await, ClusterState::Ok);
        let monitor = ClusterMonitor::new(
            Some(Box::new(ScriptedProbe {
                states: vec![ClusterState::Error],
                calls: AtomicUsize::new(0),
            })),
            0,
        );
        assert_eq!(monitor.current_state().await, ClusterState::Ok);
    }

    #[tokio::test]
    async fn caches_classification_for_the_interval() {
        let probe = ScriptedProbe {
            states: vec![ClusterState::Degraded, ClusterState::Ok],
            calls: AtomicUsize::new(0),
        };
        let monitor = ClusterMonitor::new(Some(Box::new(probe)), 3600);
        assert_eq!(monitor.current_state().await, ClusterState::Degraded);
        // Second call within the interval must reuse the cached classification.
        assert_eq!(monitor.current_state().await, ClusterState::Degraded);
    }

    #[tokio::test]
    async fn gives_up_after_max_tries_consecutive_errors() {
        let monitor = ClusterMonitor::new(
            Some(Box::new(ScriptedProbe {
                states: vec![ClusterState::Error; 3],
                calls: AtomicUsize::new(0),
            })),
            1,
        );
        assert!(!monitor.wait_until_ok(3).await);
    }
}
