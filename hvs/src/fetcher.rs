// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Host data fetching.
//!
//! Resolves a host's connection string to a connector, pulls the current
//! [`HostManifest`] with retry, and records the outcome in the host-status
//! store. Concurrent fetches for the same host are coalesced: the first
//! caller drives the fetch, everyone else shares its result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hvs_types::{HostManifest, HostState, HostStatus};

use crate::store::{HostStatusStore, HostStore};

#[derive(Debug, Clone, Default)]
pub struct HostCredentials {
    pub username: String,
    pub password: String,
}

/// A live channel to one host.
#[async_trait]
pub trait HostConnector: Send + Sync {
    async fn get_host_manifest(&self) -> Result<HostManifest>;
}

/// Opens connectors, pluggable per host type.
pub trait HostConnectorFactory: Send + Sync {
    fn connector(
        &self,
        connection_string: &str,
        credentials: &HostCredentials,
    ) -> Result<Box<dyn HostConnector>>;
}

/// Reads manifests from files named by the connection string. The stand-in
/// connector used when no agent transport is wired up.
pub struct FileHostConnectorFactory;

impl HostConnectorFactory for FileHostConnectorFactory {
    fn connector(
        &self,
        connection_string: &str,
        _credentials: &HostCredentials,
    ) -> Result<Box<dyn HostConnector>> {
        Ok(Box::new(FileHostConnector {
            path: connection_string.to_string(),
        }))
    }
}

struct FileHostConnector {
    path: String,
}

#[async_trait]
impl HostConnector for FileHostConnector {
    async fn get_host_manifest(&self) -> Result<HostManifest> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", self.path))
    }
}

// Shared result slot for coalesced fetches. Errors travel as strings so the
// slot stays cloneable.
type FetchSlot = Option<Result<HostManifest, String>>;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Total retry budget per fetch.
    pub retry_time: Duration,
    /// First retry delay; doubles up to [`MAX_BACKOFF`].
    pub initial_backoff: Duration,
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            retry_time: Duration::from_secs(300),
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Coalescing, retrying host-manifest client.
pub struct HostDataFetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    factory: Arc<dyn HostConnectorFactory>,
    credentials: HostCredentials,
    host_store: Arc<dyn HostStore>,
    host_status_store: Arc<dyn HostStatusStore>,
    config: FetcherConfig,
    in_flight: Mutex<HashMap<Uuid, watch::Receiver<FetchSlot>>>,
}

impl HostDataFetcher {
    pub fn new(
        factory: Arc<dyn HostConnectorFactory>,
        credentials: HostCredentials,
        host_store: Arc<dyn HostStore>,
        host_status_store: Arc<dyn HostStatusStore>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                factory,
                credentials,
                host_store,
                host_status_store,
                config,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Obtain the host's current manifest, sharing any fetch already in
    /// flight for it. The manifest is persisted to the host-status store
    /// before being returned.
    pub async fn fetch(&self, host_id: Uuid) -> Result<HostManifest> {
        let mut rx = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(&host_id) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(host_id, rx.clone());
                    let inner = self.inner.clone();
                    // The fetch runs detached so a cancelled caller cannot
                    // orphan the waiters sharing its result.
                    tokio::spawn(async move {
                        let result = inner.fetch_with_retry(host_id).await;
                        let shared = result.map_err(|err| format!("{err:#}"));
                        inner.in_flight.lock().await.remove(&host_id);
                        let _ = tx.send(Some(shared));
                    });
                    rx
                }
            }
        };

        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result.map_err(|err| anyhow!(err));
            }
            rx.changed()
                .await
                .context("host data fetch was abandoned")?;
        }
    }
}

impl FetcherInner {
    async fn fetch_with_retry(&self, host_id: Uuid) -> Result<HostManifest> {
        let host = self
            .host_store
            .retrieve(host_id)
            .await
            .with_context(|| format!("unknown host {host_id}"))?;
        let connector = self
            .factory
            .connector(&host.connection_string, &self.credentials)?;

        let deadline = Instant::now() + self.config.retry_time;
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1u32;
        loop {
            match connector.get_host_manifest().await {
                Ok(manifest) => {
                    debug!(%host_id, attempt, "host manifest fetched");
                    self.record_status(host_id, HostState::Connected, Some(manifest.clone()))
                        .await;
                    return Ok(manifest);
                }
                Err(err) if Instant::now() + backoff >= deadline => {
                    info!(%host_id, attempt, "host data retry budget exhausted");
                    self.record_status(host_id, HostState::ConnectionFailure, None)
                        .await;
                    return Err(err.context(format!(
                        "failed to fetch host data after {attempt} attempts"
                    )));
                }
                Err(err) => {
                    warn!(%host_id, attempt, err = format!("{err:#}"), "host data fetch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
            }
        }
    }

    /// Record the connection outcome, keeping the previous manifest when the
    /// new attempt produced none.
    async fn record_status(&self, host_id: Uuid, state: HostState, manifest: Option<HostManifest>) {
        let manifest = match manifest {
            Some(manifest) => Some(manifest),
            None => self
                .host_status_store
                .retrieve(host_id)
                .await
                .ok()
                .and_then(|s| s.host_manifest),
        };
        let status = HostStatus {
            host_id,
            state,
            host_manifest: manifest,
            created: Utc::now(),
        };
        if let Err(err) = self.host_status_store.persist(status).await {
            warn!(%host_id, %err, "failed to persist host status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{
        InMemoryFlavorGroupStore, InMemoryHostStatusStore, InMemoryHostStore,
    };
    use crate::store::{HostStatusStore as _, HostStore as _};
    use hvs_types::{Host, HostInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyConnector {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl HostConnector for FlakyConnector {
        async fn get_host_manifest(&self) -> Result<HostManifest> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(anyhow!("connection refused"))
            } else {
                // Slow enough that concurrent callers overlap the fetch.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(HostManifest {
                    host_info: HostInfo {
                        hardware_uuid: Uuid::new_v4().to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                })
            }
        }
    }

    struct FlakyFactory {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl HostConnectorFactory for FlakyFactory {
        fn connector(
            &self,
            _connection_string: &str,
            _credentials: &HostCredentials,
        ) -> Result<Box<dyn HostConnector>> {
            Ok(Box::new(FlakyConnector {
                calls: self.calls.clone(),
                fail_first: self.fail_first,
            }))
        }
    }

    async fn fetcher_with(
        fail_first: usize,
        retry_time: Duration,
    ) -> (HostDataFetcher, Uuid, Arc<AtomicUsize>) {
        let groups = InMemoryFlavorGroupStore::new();
        let hosts = InMemoryHostStore::new(groups);
        let statuses = InMemoryHostStatusStore::new();
        let host = Host {
            id: Uuid::new_v4(),
            hardware_uuid: Uuid::new_v4(),
            host_name: "node1".to_string(),
            connection_string: "test://node1".to_string(),
            description: String::new(),
            flavorgroup_names: vec![],
        };
        hosts.create(host.clone()).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = HostDataFetcher::new(
            Arc::new(FlakyFactory {
                calls: calls.clone(),
                fail_first,
            }),
            HostCredentials::default(),
            hosts,
            statuses,
            FetcherConfig {
                retry_time,
                initial_backoff: Duration::from_millis(10),
            },
        );
        (fetcher, host.id, calls)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let (fetcher, host_id, calls) = fetcher_with(2, Duration::from_secs(5)).await;
        let manifest = fetcher.fetch(host_id).await.unwrap();
        assert!(!manifest.host_info.hardware_uuid.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let status = fetcher
            .inner
            .host_status_store
            .retrieve(host_id)
            .await
            .unwrap();
        assert_eq!(status.state, HostState::Connected);
        assert!(status.host_manifest.is_some());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_records_failure() {
        let (fetcher, host_id, _) = fetcher_with(usize::MAX, Duration::from_millis(30)).await;
        let err = fetcher.fetch(host_id).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));

        let status = fetcher
            .inner
            .host_status_store
            .retrieve(host_id)
            .await
            .unwrap();
        assert_eq!(status.state, HostState::ConnectionFailure);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        // One slow successful fetch; ten callers share it.
        let (fetcher, host_id, calls) = fetcher_with(0, Duration::from_secs(5)).await;
        let fetcher = Arc::new(fetcher);
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let fetcher = fetcher.clone();
            tasks.push(tokio::spawn(async move { fetcher.fetch(host_id).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // Coalescing keeps the connector call count well below the caller
        // count (a straggler may start a second fetch after the first
        // completes).
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_unknown_host_fails_fast() {
        let (fetcher, _, calls) = fetcher_with(0, Duration::from_secs(5)).await;
        let err = fetcher.fetch(Uuid::new_v4()).await.unwrap_err();
        assert!(format!("{err:#}").contains("unknown host"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
