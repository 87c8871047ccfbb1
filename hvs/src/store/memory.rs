// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory reference stores.
//!
//! Plain map-backed implementations of the store contracts, safe for
//! concurrent use. Where a database would answer joins (group membership,
//! trust-cache-by-group), these implementations consult the sibling store
//! they were constructed with.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use hvs_types::{
    FlavorGroup, Host, HostStatus, HvsReport, QueueEntry, QueueState, SignedFlavor,
};

use super::{
    FlavorFilter, FlavorGroupFilter, FlavorGroupStore, FlavorStore, HostFilter, HostStatusStore,
    HostStore, QueueStore, ReportFilter, ReportStore, StoreError, StoreResult,
};

fn poisoned(_: impl std::fmt::Debug) -> StoreError {
    StoreError::Backend("store lock poisoned".to_string())
}

#[derive(Default)]
pub struct InMemoryFlavorGroupStore {
    groups: RwLock<BTreeMap<Uuid, FlavorGroup>>,
    // flavorgroup↔flavor membership
    links: RwLock<HashMap<Uuid, Vec<Uuid>>>,
}

impl InMemoryFlavorGroupStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl FlavorGroupStore for InMemoryFlavorGroupStore {
    async fn create(&self, group: FlavorGroup) -> StoreResult<FlavorGroup> {
        self.groups
            .write()
            .map_err(poisoned)?
            .insert(group.id, group.clone());
        Ok(group)
    }

    async fn retrieve(&self, id: Uuid) -> StoreResult<FlavorGroup> {
        self.groups
            .read()
            .map_err(poisoned)?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn search(&self, filter: &FlavorGroupFilter) -> StoreResult<Vec<FlavorGroup>> {
        let groups = self.groups.read().map_err(poisoned)?;
        Ok(groups
            .values()
            .filter(|g| filter.ids.is_empty() || filter.ids.contains(&g.id))
            .filter(|g| filter.name.as_ref().is_none_or(|name| &g.name == name))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        self.links.write().map_err(poisoned)?.remove(&id);
        self.groups
            .write()
            .map_err(poisoned)?
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn add_flavors(&self, group_id: Uuid, flavor_ids: &[Uuid]) -> StoreResult<()> {
        let mut links = self.links.write().map_err(poisoned)?;
        let linked = links.entry(group_id).or_default();
        for id in flavor_ids {
            if !linked.contains(id) {
                linked.push(*id);
            }
        }
        Ok(())
    }

    async fn flavor_ids(&self, group_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .links
            .read()
            .map_err(poisoned)?
            .get(&group_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct InMemoryFlavorStore {
    flavors: RwLock<BTreeMap<Uuid, SignedFlavor>>,
    flavorgroup_store: Arc<InMemoryFlavorGroupStore>,
}

impl InMemoryFlavorStore {
    pub fn new(flavorgroup_store: Arc<InMemoryFlavorGroupStore>) -> Arc<Self> {
        Arc::new(Self {
            flavors: RwLock::new(BTreeMap::new()),
            flavorgroup_store,
        })
    }
}

#[async_trait]
impl FlavorStore for InMemoryFlavorStore {
    async fn create(&self, flavor: SignedFlavor) -> StoreResult<SignedFlavor> {
        self.flavors
            .write()
            .map_err(poisoned)?
            .insert(flavor.id(), flavor.clone());
        Ok(flavor)
    }

    async fn retrieve(&self, id: Uuid) -> StoreResult<SignedFlavor> {
        self.flavors
            .read()
            .map_err(poisoned)?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn search(&self, filter: &FlavorFilter) -> StoreResult<Vec<SignedFlavor>> {
        let group_members: Option<HashSet<Uuid>> = match filter.flavorgroup_id {
            Some(group_id) => Some(
                self.flavorgroup_store
                    .flavor_ids(group_id)
                    .await?
                    .into_iter()
                    .collect(),
            ),
            None => None,
        };

        let flavors = self.flavors.read().map_err(poisoned)?;
        Ok(flavors
            .values()
            .filter(|f| filter.ids.is_empty() || filter.ids.contains(&f.id()))
            .filter(|f| {
                group_members
                    .as_ref()
                    .is_none_or(|members| members.contains(&f.id()))
            })
            .filter(|f| {
                filter.flavor_parts.is_empty()
                    || f.part().is_some_and(|p| filter.flavor_parts.contains(&p))
            })
            .filter(|f| match (filter.hardware_uuid, f.part()) {
                (Some(hw), Some(part)) if part.is_host_specific() => {
                    f.flavor.meta.description.hardware_uuid == Some(hw)
                }
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        self.flavors
            .write()
            .map_err(poisoned)?
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

pub struct InMemoryHostStore {
    hosts: RwLock<BTreeMap<Uuid, Host>>,
    // host↔flavorgroup membership
    group_links: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    // trust cache: host → flavor IDs whose last verification matched
    trust_cache: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    flavorgroup_store: Arc<InMemoryFlavorGroupStore>,
}

impl InMemoryHostStore {
    pub fn new(flavorgroup_store: Arc<InMemoryFlavorGroupStore>) -> Arc<Self> {
        Arc::new(Self {
            hosts: RwLock::new(BTreeMap::new()),
            group_links: RwLock::new(HashMap::new()),
            trust_cache: RwLock::new(HashMap::new()),
            flavorgroup_store,
        })
    }
}

#[async_trait]
impl HostStore for InMemoryHostStore {
    async fn create(&self, host: Host) -> StoreResult<Host> {
        self.hosts
            .write()
            .map_err(poisoned)?
            .insert(host.id, host.clone());
        Ok(host)
    }

    async fn retrieve(&self, id: Uuid) -> StoreResult<Host> {
        self.hosts
            .read()
            .map_err(poisoned)?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update(&self, host: Host) -> StoreResult<Host> {
        let mut hosts = self.hosts.write().map_err(poisoned)?;
        if !hosts.contains_key(&host.id) {
            return Err(StoreError::NotFound);
        }
        hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        self.group_links.write().map_err(poisoned)?.remove(&id);
        self.trust_cache.write().map_err(poisoned)?.remove(&id);
        self.hosts
            .write()
            .map_err(poisoned)?
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn search(&self, filter: &HostFilter) -> StoreResult<Vec<Host>> {
        let hosts = self.hosts.read().map_err(poisoned)?;
        Ok(hosts
            .values()
            .filter(|h| filter.id.is_none_or(|id| h.id == id))
            .filter(|h| filter.hardware_uuid.is_none_or(|hw| h.hardware_uuid == hw))
            .cloned()
            .collect())
    }

    async fn search_flavorgroups(&self, host_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .group_links
            .read()
            .map_err(poisoned)?
            .get(&host_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_flavorgroups(&self, host_id: Uuid, group_ids: &[Uuid]) -> StoreResult<()> {
        let mut links = self.group_links.write().map_err(poisoned)?;
        let linked = links.entry(host_id).or_default();
        for id in group_ids {
            if !linked.contains(id) {
                linked.push(*id);
            }
        }
        Ok(())
    }

    async fn retrieve_trust_cache_flavors(
        &self,
        host_id: Uuid,
        group_id: Uuid,
    ) -> StoreResult<Vec<Uuid>> {
        let group_members: HashSet<Uuid> = self
            .flavorgroup_store
            .flavor_ids(group_id)
            .await?
            .into_iter()
            .collect();
        let cache = self.trust_cache.read().map_err(poisoned)?;
        Ok(cache
            .get(&host_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| group_members.contains(id))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_trust_cache_flavors(&self, host_id: Uuid, flavor_ids: &[Uuid]) -> StoreResult<()> {
        let mut cache = self.trust_cache.write().map_err(poisoned)?;
        let cached = cache.entry(host_id).or_default();
        for id in flavor_ids {
            if !cached.contains(id) {
                cached.push(*id);
            }
        }
        Ok(())
    }

    async fn remove_trust_cache_flavors(
        &self,
        host_id: Uuid,
        flavor_ids: &[Uuid],
    ) -> StoreResult<()> {
        let mut cache = self.trust_cache.write().map_err(poisoned)?;
        if let Some(cached) = cache.get_mut(&host_id) {
            cached.retain(|id| !flavor_ids.contains(id));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryHostStatusStore {
    statuses: RwLock<HashMap<Uuid, HostStatus>>,
}

impl InMemoryHostStatusStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl HostStatusStore for InMemoryHostStatusStore {
    async fn persist(&self, status: HostStatus) -> StoreResult<()> {
        self.statuses
            .write()
            .map_err(poisoned)?
            .insert(status.host_id, status);
        Ok(())
    }

    async fn retrieve(&self, host_id: Uuid) -> StoreResult<HostStatus> {
        self.statuses
            .read()
            .map_err(poisoned)?
            .get(&host_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

#[derive(Default)]
pub struct InMemoryReportStore {
    reports: RwLock<BTreeMap<Uuid, HvsReport>>,
}

impl InMemoryReportStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn create(&self, report: HvsReport) -> StoreResult<HvsReport> {
        self.reports
            .write()
            .map_err(poisoned)?
            .insert(report.id, report.clone());
        Ok(report)
    }

    async fn update(&self, report: HvsReport) -> StoreResult<HvsReport> {
        let mut reports = self.reports.write().map_err(poisoned)?;
        reports.retain(|_, r| r.host_id != report.host_id);
        reports.insert(report.id, report.clone());
        Ok(report)
    }

    async fn search(&self, filter: &ReportFilter) -> StoreResult<Vec<HvsReport>> {
        let reports = self.reports.read().map_err(poisoned)?;
        Ok(reports
            .values()
            .filter(|r| filter.host_id.is_none_or(|id| r.host_id == id))
            .filter(|r| {
                filter
                    .expires_before
                    .is_none_or(|cutoff| r.expiration < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        self.reports
            .write()
            .map_err(poisoned)?
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[derive(Default)]
pub struct InMemoryQueueStore {
    // insertion order doubles as FIFO order
    entries: RwLock<Vec<QueueEntry>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn create(&self, entry: QueueEntry) -> StoreResult<QueueEntry> {
        self.entries
            .write()
            .map_err(poisoned)?
            .push(entry.clone());
        Ok(entry)
    }

    async fn update(&self, entry: QueueEntry) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => {
                *slot = entry;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn search(&self, states: &[QueueState]) -> StoreResult<Vec<QueueEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .iter()
            .filter(|e| states.contains(&e.state))
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hvs_types::Flavor;

    fn flavor(part: &str, id: Uuid) -> SignedFlavor {
        let json = format!(
            r#"{{"meta":{{"id":"{id}","description":{{"flavor_part":"{part}"}}}}}}"#
        );
        SignedFlavor {
            flavor: Flavor::from_json(&json).unwrap(),
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn test_flavor_search_by_group_and_part() {
        let groups = InMemoryFlavorGroupStore::new();
        let flavors = InMemoryFlavorStore::new(groups.clone());

        let group = FlavorGroup::automatic();
        let group_id = group.id;
        groups.create(group).await.unwrap();

        let platform = flavor("PLATFORM", Uuid::new_v4());
        let os = flavor("OS", Uuid::new_v4());
        let orphan = flavor("PLATFORM", Uuid::new_v4());
        for f in [&platform, &os, &orphan] {
            flavors.create(f.clone()).await.unwrap();
        }
        groups
            .add_flavors(group_id, &[platform.id(), os.id()])
            .await
            .unwrap();

        let found = flavors
            .search(&FlavorFilter {
                flavorgroup_id: Some(group_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        let found = flavors
            .search(&FlavorFilter {
                flavorgroup_id: Some(group_id),
                flavor_parts: vec![hvs_types::FlavorPart::Os],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), os.id());
    }

    #[tokio::test]
    async fn test_trust_cache_scoped_by_group() {
        let groups = InMemoryFlavorGroupStore::new();
        let hosts = InMemoryHostStore::new(groups.clone());

        let host_id = Uuid::new_v4();
        let group_a = FlavorGroup::automatic();
        let mut group_b = FlavorGroup::automatic();
        group_b.name = "other".to_string();
        let (flavor_a, flavor_b) = (Uuid::new_v4(), Uuid::new_v4());
        groups.create(group_a.clone()).await.unwrap();
        groups.create(group_b.clone()).await.unwrap();
        groups.add_flavors(group_a.id, &[flavor_a]).await.unwrap();
        groups.add_flavors(group_b.id, &[flavor_b]).await.unwrap();

        hosts
            .add_trust_cache_flavors(host_id, &[flavor_a, flavor_b])
            .await
            .unwrap();

        let cached = hosts
            .retrieve_trust_cache_flavors(host_id, group_a.id)
            .await
            .unwrap();
        assert_eq!(cached, vec![flavor_a]);

        hosts
            .remove_trust_cache_flavors(host_id, &[flavor_a])
            .await
            .unwrap();
        let cached = hosts
            .retrieve_trust_cache_flavors(host_id, group_a.id)
            .await
            .unwrap();
        assert!(cached.is_empty());
    }

    #[tokio::test]
    async fn test_report_update_is_upsert_by_host() {
        let reports = InMemoryReportStore::new();
        let host_id = Uuid::new_v4();
        let make = |id| HvsReport {
            id,
            host_id,
            created_at: chrono::Utc::now(),
            expiration: chrono::Utc::now(),
            trust_report: hvs_types::TrustReport::new(Default::default()),
            saml: String::new(),
        };

        reports.update(make(Uuid::new_v4())).await.unwrap();
        let replacement = make(Uuid::new_v4());
        reports.update(replacement.clone()).await.unwrap();

        let found = reports
            .search(&ReportFilter {
                host_id: Some(host_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, replacement.id);
    }
}
