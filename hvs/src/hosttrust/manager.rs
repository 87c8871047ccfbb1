// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hvs_types::{HvsReport, QueueEntry, QueueState, VerifyParams};

use crate::fetcher::HostDataFetcher;
use crate::store::{HostStatusStore, QueueStore, ReportStore, StoreResult};

use super::verifier::HostTrustVerifier;

/// How long an idle worker waits before re-scanning the queue. Doubles as
/// the retry backoff for entries deferred because their host was busy.
const POLL_BACKOFF: Duration = Duration::from_millis(250);

/// Grace period for in-flight jobs on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Coordination surface for verification jobs.
#[async_trait]
pub trait HostTrustManager: Send + Sync {
    /// Verify one host synchronously, bypassing the queue but honouring the
    /// per-host serialisation.
    async fn verify_host(
        &self,
        host_id: Uuid,
        fetch_host_data: bool,
        prefer_hash_match: bool,
    ) -> Result<Option<HvsReport>>;

    /// Enqueue one verification job per host; returns once the entries are
    /// persisted.
    async fn verify_hosts_async(
        &self,
        host_ids: &[Uuid],
        fetch_host_data: bool,
        prefer_hash_match: bool,
    ) -> Result<()>;

    /// Recover PENDING entries from a previous run and resume draining.
    async fn process_queue(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HostTrustServiceConfig {
    /// Size of the worker pool.
    pub verifiers: usize,
    /// Soft per-job timeout.
    pub job_timeout: Duration,
}

/// Queue-backed trust manager: a bounded worker pool draining the durable
/// verification queue with at-most-one in-flight job per host.
pub struct HostTrustService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    queue_store: Arc<dyn QueueStore>,
    host_status_store: Arc<dyn HostStatusStore>,
    report_store: Arc<dyn ReportStore>,
    fetcher: Arc<HostDataFetcher>,
    verifier: Arc<HostTrustVerifier>,
    config: HostTrustServiceConfig,
    /// Host IDs currently claimed by some job. Checked-and-inserted
    /// atomically under the lock; this is what linearises per-host work.
    in_flight: Mutex<HashSet<Uuid>>,
    host_released: Notify,
    work_available: Notify,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl HostTrustService {
    pub fn new(
        queue_store: Arc<dyn QueueStore>,
        host_status_store: Arc<dyn HostStatusStore>,
        report_store: Arc<dyn ReportStore>,
        fetcher: Arc<HostDataFetcher>,
        verifier: Arc<HostTrustVerifier>,
        config: HostTrustServiceConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServiceInner {
                queue_store,
                host_status_store,
                report_store,
                fetcher,
                verifier,
                config,
                in_flight: Mutex::new(HashSet::new()),
                host_released: Notify::new(),
                work_available: Notify::new(),
                shutdown_tx,
                workers: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Stop the worker pool, letting in-flight jobs finish within a bounded
    /// grace period.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let mut workers = self.inner.workers.lock().await;
        for mut handle in workers.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                warn!("worker did not stop within grace period, aborting");
                handle.abort();
            }
        }
        info!("host trust manager stopped");
    }
}

#[async_trait]
impl HostTrustManager for HostTrustService {
    async fn verify_host(
        &self,
        host_id: Uuid,
        fetch_host_data: bool,
        prefer_hash_match: bool,
    ) -> Result<Option<HvsReport>> {
        let inner = &self.inner;
        inner.claim_host(host_id).await;
        let params = VerifyParams {
            host_id,
            fetch_host_data,
            prefer_hash_match,
        };
        let outcome = tokio::time::timeout(inner.config.job_timeout, inner.execute(params)).await;
        inner.release_host(host_id).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "verification of host {host_id} exceeded {:?}",
                inner.config.job_timeout
            )),
        }
    }

    async fn verify_hosts_async(
        &self,
        host_ids: &[Uuid],
        fetch_host_data: bool,
        prefer_hash_match: bool,
    ) -> Result<()> {
        for host_id in host_ids {
            let entry = QueueEntry::flavor_verify(*host_id, fetch_host_data, prefer_hash_match);
            self.inner
                .queue_store
                .create(entry)
                .await
                .with_context(|| format!("failed to enqueue verification of host {host_id}"))?;
        }
        debug!(count = host_ids.len(), "enqueued verification jobs");
        self.inner.work_available.notify_waiters();
        Ok(())
    }

    async fn process_queue(&self) -> Result<()> {
        let inner = &self.inner;
        // Entries left PENDING by a previous run were interrupted mid-job;
        // put them back in line.
        let pending = inner
            .queue_store
            .search(&[QueueState::Pending])
            .await
            .context("failed to scan queue for recovery")?;
        for mut entry in pending {
            info!(entry_id = %entry.id, host_id = %entry.params.host_id, "recovering interrupted queue entry");
            entry.state = QueueState::New;
            entry.updated = Utc::now();
            inner
                .queue_store
                .update(entry)
                .await
                .context("failed to recover queue entry")?;
        }

        if !inner.started.swap(true, Ordering::SeqCst) {
            let mut workers = inner.workers.lock().await;
            for worker in 0..inner.config.verifiers.max(1) {
                let inner = inner.clone();
                workers.push(tokio::spawn(async move {
                    worker_loop(inner, worker).await;
                }));
            }
        }
        inner.work_available.notify_waiters();
        Ok(())
    }
}

async fn worker_loop(inner: Arc<ServiceInner>, worker: usize) {
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    debug!(worker, "verification worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        match inner.claim_next().await {
            Ok(Some(entry)) => inner.process_entry(entry).await,
            Ok(None) => {
                tokio::select! {
                    _ = inner.work_available.notified() => {}
                    _ = inner.host_released.notified() => {}
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(POLL_BACKOFF) => {}
                }
            }
            Err(err) => {
                warn!(worker, %err, "queue scan failed");
                tokio::time::sleep(POLL_BACKOFF).await;
            }
        }
    }
    debug!(worker, "verification worker stopped");
}

impl ServiceInner {
    /// Claim the oldest NEW entry whose host is not already in flight and
    /// mark it PENDING. Entries for busy hosts stay NEW; they are retried
    /// once the other job releases its host.
    async fn claim_next(&self) -> StoreResult<Option<QueueEntry>> {
        let mut in_flight = self.in_flight.lock().await;
        let entries = self.queue_store.search(&[QueueState::New]).await?;
        for mut entry in entries {
            if !in_flight.insert(entry.params.host_id) {
                continue;
            }
            entry.state = QueueState::Pending;
            entry.updated = Utc::now();
            if let Err(err) = self.queue_store.update(entry.clone()).await {
                in_flight.remove(&entry.params.host_id);
                return Err(err);
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }

    async fn process_entry(&self, entry: QueueEntry) {
        let host_id = entry.params.host_id;
        let outcome =
            tokio::time::timeout(self.config.job_timeout, self.execute(entry.params)).await;
        let (state, message) = match outcome {
            Ok(Ok(_)) => (QueueState::Completed, None),
            Ok(Err(err)) => {
                warn!(%host_id, err = format!("{err:#}"), "verification job failed");
                (QueueState::Error, Some(format!("{err:#}")))
            }
            Err(_) => (
                QueueState::Timeout,
                Some(format!(
                    "job exceeded the {:?} verification timeout",
                    self.config.job_timeout
                )),
            ),
        };

        // The report write (inside execute) is visible before the entry
        // turns terminal.
        let mut done = entry;
        done.state = state;
        done.message = message;
        done.updated = Utc::now();
        let done_id = done.id;
        if let Err(err) = self.queue_store.update(done).await {
            error!(%host_id, %err, "failed to finalise queue entry");
        }
        if state == QueueState::Completed {
            self.collect_terminal_entries(host_id, done_id).await;
        }
        self.release_host(host_id).await;
    }

    async fn execute(&self, params: VerifyParams) -> Result<Option<HvsReport>> {
        let host_id = params.host_id;

        if params.prefer_hash_match {
            if let Some(report) = self.current_report(host_id).await {
                if report.expiration > Utc::now() {
                    debug!(%host_id, "existing report still valid, skipping re-verification");
                    return Ok(Some(report));
                }
            }
        }

        let manifest = if params.fetch_host_data {
            self.fetcher
                .fetch(host_id)
                .await
                .context("failed to fetch host data")?
        } else {
            let status = self
                .host_status_store
                .retrieve(host_id)
                .await
                .with_context(|| format!("no status on record for host {host_id}"))?;
            status
                .host_manifest
                .ok_or_else(|| anyhow!("no manifest on record for host {host_id}"))?
        };

        let report = self
            .verifier
            .verify(host_id, Some(&manifest), params.fetch_host_data)
            .await?;
        Ok(report)
    }

    async fn current_report(&self, host_id: Uuid) -> Option<HvsReport> {
        self.report_store
            .search(&crate::store::ReportFilter {
                host_id: Some(host_id),
                ..Default::default()
            })
            .await
            .ok()?
            .into_iter()
            .next()
    }

    /// Drop older terminal entries for the host now that a fresh
    /// verification has completed.
    async fn collect_terminal_entries(&self, host_id: Uuid, keep: Uuid) {
        let terminal = [
            QueueState::Completed,
            QueueState::Error,
            QueueState::Timeout,
            QueueState::Cancelled,
        ];
        let entries = match self.queue_store.search(&terminal).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%host_id, %err, "failed to scan terminal queue entries");
                return;
            }
        };
        for entry in entries {
            if entry.params.host_id != host_id || entry.id == keep {
                continue;
            }
            if let Err(err) = self.queue_store.delete(entry.id).await {
                warn!(entry_id = %entry.id, %err, "failed to collect terminal queue entry");
            }
        }
    }

    /// Wait until `host_id` can be claimed exclusively.
    async fn claim_host(&self, host_id: Uuid) {
        loop {
            // Register for release notifications before checking, so a
            // release between the check and the await is not lost.
            let released = self.host_released.notified();
            {
                let mut in_flight = self.in_flight.lock().await;
                if in_flight.insert(host_id) {
                    return;
                }
            }
            released.await;
        }
    }

    async fn release_host(&self, host_id: Uuid) {
        self.in_flight.lock().await.remove(&host_id);
        self.host_released.notify_waiters();
    }
}
