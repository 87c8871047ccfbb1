// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Host report refresher.
//!
//! A single periodic task that re-queues verification for hosts whose
//! reports are past or near expiry: each tick selects every report expiring
//! before `now + period`, which covers both long-expired reports and those
//! that would lapse before the next tick.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::hosttrust::HostTrustManager;
use crate::store::{ReportFilter, ReportStore};

pub struct HostReportRefresher {
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HostReportRefresher {
    /// Start the background refresh task.
    pub fn run(
        period: Duration,
        report_store: Arc<dyn ReportStore>,
        manager: Arc<dyn HostTrustManager>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            info!(?period, "host report refresher started");
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => {}
                }
                if *stop_rx.borrow() {
                    break;
                }
                refresh_expiring(period, report_store.as_ref(), manager.as_ref()).await;
            }
            info!("host report refresher stopped");
        });
        Self {
            stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop promptly; does not wait for verifications the refresher has
    /// already triggered.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn refresh_expiring(
    period: Duration,
    report_store: &dyn ReportStore,
    manager: &dyn HostTrustManager,
) {
    let cutoff = Utc::now()
        + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::seconds(0));
    let expiring = match report_store
        .search(&ReportFilter {
            expires_before: Some(cutoff),
            ..Default::default()
        })
        .await
    {
        Ok(reports) => reports,
        Err(err) => {
            warn!(%err, "failed to scan for expiring reports");
            return;
        }
    };
    if expiring.is_empty() {
        return;
    }

    let host_ids: Vec<_> = expiring
        .iter()
        .map(|r| r.host_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    debug!(count = host_ids.len(), "re-queueing hosts with expiring reports");
    if let Err(err) = manager.verify_hosts_async(&host_ids, true, false).await {
        warn!(%err, "failed to enqueue report refresh");
    }
}
