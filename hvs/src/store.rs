// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Store contracts for the host-trust core.
//!
//! Every store exclusively owns its persisted rows and is safe under
//! concurrent readers and writers. Real deployments back these traits with a
//! database; the [`memory`] module provides the reference implementations the
//! binary and the test-suite run on.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use hvs_types::{
    FlavorGroup, FlavorPart, Host, HostStatus, HvsReport, QueueEntry, QueueState, SignedFlavor,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("store backend failure: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct FlavorFilter {
    pub ids: Vec<Uuid>,
    pub flavorgroup_id: Option<Uuid>,
    pub flavor_parts: Vec<FlavorPart>,
    /// Restrict HOST_UNIQUE / ASSET_TAG flavors to one host's binding.
    pub hardware_uuid: Option<Uuid>,
}

#[async_trait]
pub trait FlavorStore: Send + Sync {
    async fn create(&self, flavor: SignedFlavor) -> StoreResult<SignedFlavor>;
    async fn retrieve(&self, id: Uuid) -> StoreResult<SignedFlavor>;
    async fn search(&self, filter: &FlavorFilter) -> StoreResult<Vec<SignedFlavor>>;
    async fn delete(&self, id: Uuid) -> StoreResult<()>;
}

#[derive(Debug, Clone, Default)]
pub struct FlavorGroupFilter {
    pub ids: Vec<Uuid>,
    pub name: Option<String>,
}

#[async_trait]
pub trait FlavorGroupStore: Send + Sync {
    async fn create(&self, group: FlavorGroup) -> StoreResult<FlavorGroup>;
    async fn retrieve(&self, id: Uuid) -> StoreResult<FlavorGroup>;
    async fn search(&self, filter: &FlavorGroupFilter) -> StoreResult<Vec<FlavorGroup>>;
    async fn delete(&self, id: Uuid) -> StoreResult<()>;
    /// Link flavors into the group (the flavorgroup↔flavor membership table).
    async fn add_flavors(&self, group_id: Uuid, flavor_ids: &[Uuid]) -> StoreResult<()>;
    async fn flavor_ids(&self, group_id: Uuid) -> StoreResult<Vec<Uuid>>;
}

#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    pub id: Option<Uuid>,
    pub hardware_uuid: Option<Uuid>,
}

#[async_trait]
pub trait HostStore: Send + Sync {
    async fn create(&self, host: Host) -> StoreResult<Host>;
    async fn retrieve(&self, id: Uuid) -> StoreResult<Host>;
    async fn update(&self, host: Host) -> StoreResult<Host>;
    async fn delete(&self, id: Uuid) -> StoreResult<()>;
    async fn search(&self, filter: &HostFilter) -> StoreResult<Vec<Host>>;
    /// Flavor groups the host belongs to (the host↔flavorgroup membership
    /// table).
    async fn search_flavorgroups(&self, host_id: Uuid) -> StoreResult<Vec<Uuid>>;
    async fn add_flavorgroups(&self, host_id: Uuid, group_ids: &[Uuid]) -> StoreResult<()>;
    /// Flavor IDs cached as matching for this host, restricted to one group.
    async fn retrieve_trust_cache_flavors(
        &self,
        host_id: Uuid,
        group_id: Uuid,
    ) -> StoreResult<Vec<Uuid>>;
    async fn add_trust_cache_flavors(&self, host_id: Uuid, flavor_ids: &[Uuid]) -> StoreResult<()>;
    async fn remove_trust_cache_flavors(
        &self,
        host_id: Uuid,
        flavor_ids: &[Uuid],
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait HostStatusStore: Send + Sync {
    /// Replace the last-known status for the host.
    async fn persist(&self, status: HostStatus) -> StoreResult<()>;
    async fn retrieve(&self, host_id: Uuid) -> StoreResult<HostStatus>;
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub host_id: Option<Uuid>,
    /// Matches reports with `expiration < expires_before`, covering both
    /// already-expired reports and those about to expire.
    pub expires_before: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn create(&self, report: HvsReport) -> StoreResult<HvsReport>;
    /// Upsert by host: replaces any existing report for `report.host_id`.
    async fn update(&self, report: HvsReport) -> StoreResult<HvsReport>;
    async fn search(&self, filter: &ReportFilter) -> StoreResult<Vec<HvsReport>>;
    async fn delete(&self, id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn create(&self, entry: QueueEntry) -> StoreResult<QueueEntry>;
    async fn update(&self, entry: QueueEntry) -> StoreResult<()>;
    /// Entries in any of `states`, oldest first.
    async fn search(&self, states: &[QueueState]) -> StoreResult<Vec<QueueEntry>>;
    async fn delete(&self, id: Uuid) -> StoreResult<()>;
}
