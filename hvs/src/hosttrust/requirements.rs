// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use tracing::debug;
use uuid::Uuid;

use flavor_verifier::VerifierCerts;
use hvs_types::{
    FlavorGroup, FlavorMatchPolicy, FlavorPart, HostManifest, MatchType, RequiredType,
    SignedFlavor, TrustReport,
};

use crate::store::{FlavorFilter, FlavorStore, StoreResult};

/// Per-(host, flavor-group) set of flavors known to match the host's
/// last-seen state, together with the rule results that established it.
pub struct HostTrustCache {
    pub host_id: Uuid,
    pub trusted_flavors: Vec<SignedFlavor>,
    pub trust_report: TrustReport,
}

impl HostTrustCache {
    pub fn empty(host_id: Uuid, host_manifest: &HostManifest) -> Self {
        Self {
            host_id,
            trusted_flavors: Vec::new(),
            trust_report: TrustReport::new(host_manifest.clone()),
        }
    }

    pub fn contains(&self, flavor_id: Uuid) -> bool {
        self.trusted_flavors.iter().any(|f| f.id() == flavor_id)
    }
}

/// The precise set of flavor-matches a host must satisfy for one flavor
/// group to be considered trusted. Borrows nothing: a snapshot of the
/// group's flavors taken at construction time.
pub struct FlavorGroupReqs {
    pub host_id: Uuid,
    pub hardware_uuid: Uuid,
    pub flavorgroup_id: Uuid,
    /// Ordered per-part policies, as declared by the group.
    pub match_policies: Vec<FlavorMatchPolicy>,
    /// Parts that must be satisfied for this host.
    pub defined_and_required_parts: Vec<FlavorPart>,
    /// Group flavor IDs per part, restricted to this host's hardware UUID
    /// for HOST_UNIQUE and ASSET_TAG parts.
    pub flavors_by_part: BTreeMap<FlavorPart, Vec<Uuid>>,
    /// For parts matched LATEST: the single most recently created flavor
    /// (ties broken by largest ID).
    pub latest_flavors_by_part: BTreeMap<FlavorPart, Uuid>,
    pub skip_signature_verification: bool,
}

impl FlavorGroupReqs {
    pub async fn new(
        host_id: Uuid,
        hardware_uuid: Uuid,
        flavorgroup: &FlavorGroup,
        flavor_store: &dyn FlavorStore,
        host_manifest: &HostManifest,
        skip_signature_verification: bool,
    ) -> StoreResult<Self> {
        let group_flavors = flavor_store
            .search(&FlavorFilter {
                flavorgroup_id: Some(flavorgroup.id),
                ..Default::default()
            })
            .await?;

        let mut flavors_by_part: BTreeMap<FlavorPart, Vec<Uuid>> = BTreeMap::new();
        let mut latest_flavors_by_part = BTreeMap::new();
        for flavor in &group_flavors {
            let Some(part) = flavor.part() else {
                continue;
            };
            // Host-specific flavors only bind to this host when their
            // hardware UUID matches.
            if part.is_host_specific()
                && flavor.flavor.meta.description.hardware_uuid != Some(hardware_uuid)
            {
                continue;
            }
            flavors_by_part.entry(part).or_default().push(flavor.id());

            if flavorgroup.match_policy(part).map(|p| p.match_type) == Some(MatchType::Latest) {
                let candidate = (flavor.flavor.meta.created, flavor.id());
                let current = latest_flavors_by_part.entry(part).or_insert(candidate);
                if candidate > *current {
                    *current = candidate;
                }
            }
        }
        let latest_flavors_by_part = latest_flavors_by_part
            .into_iter()
            .map(|(part, (_, id))| (part, id))
            .collect();

        let mut defined_and_required_parts = Vec::new();
        for policy in &flavorgroup.flavor_match_policies {
            let part = policy.flavor_part;
            let has_flavors = flavors_by_part.contains_key(&part);
            // ASSET_TAG is also defined by evidence the host itself reports.
            let defined = has_flavors
                || (part == FlavorPart::AssetTag && !host_manifest.asset_tag_digest.is_empty());
            let required = match policy.match_policy.required {
                RequiredType::Required => true,
                RequiredType::RequiredIfDefined => defined,
            };
            if required {
                defined_and_required_parts.push(part);
            }
        }
        debug!(
            %host_id,
            flavorgroup = %flavorgroup.name,
            required_parts = ?defined_and_required_parts,
            "built flavor-group trust requirements"
        );

        Ok(Self {
            host_id,
            hardware_uuid,
            flavorgroup_id: flavorgroup.id,
            match_policies: flavorgroup.flavor_match_policies.clone(),
            defined_and_required_parts,
            flavors_by_part,
            latest_flavors_by_part,
            skip_signature_verification,
        })
    }

    fn match_policy(&self, part: FlavorPart) -> Option<FlavorMatchPolicy> {
        self.match_policies
            .iter()
            .find(|p| p.flavor_part == part)
            .copied()
    }

    /// Whether the cached evidence satisfies one part's match policy.
    pub fn part_satisfied(&self, part: FlavorPart, cache: &HostTrustCache) -> bool {
        let Some(policy) = self.match_policy(part) else {
            return true;
        };
        match policy.match_policy.match_type {
            MatchType::AnyOf => cache.trusted_flavors.iter().any(|f| f.part() == Some(part)),
            MatchType::AllOf => self
                .flavors_by_part
                .get(&part)
                .map(|ids| ids.iter().all(|id| cache.contains(*id)))
                .unwrap_or(false),
            MatchType::Latest => self
                .latest_flavors_by_part
                .get(&part)
                .map(|id| cache.contains(*id))
                .unwrap_or(false),
        }
    }

    /// True iff every defined-and-required part is satisfied by the cache
    /// and every cached flavor's signature still verifies.
    pub fn meets_flavor_group_reqs(&self, cache: &HostTrustCache, certs: &VerifierCerts) -> bool {
        for part in &self.defined_and_required_parts {
            if !self.part_satisfied(*part, cache) {
                debug!(host_id = %self.host_id, part = %part, "part requirement not met by cache");
                return false;
            }
        }
        if !self.skip_signature_verification {
            for flavor in &cache.trusted_flavors {
                if !matches!(certs.verify_flavor_signature(flavor), Ok(true)) {
                    debug!(
                        host_id = %self.host_id,
                        flavor_id = %flavor.id(),
                        "cached flavor signature no longer verifies"
                    );
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{InMemoryFlavorGroupStore, InMemoryFlavorStore};
    use hvs_types::{Flavor, MatchPolicy};

    fn signed(part: &str, id: Uuid, extra: &str) -> SignedFlavor {
        let json = format!(
            r#"{{"meta":{{"id":"{id}","description":{{"flavor_part":"{part}"{extra}}}}}}}"#
        );
        SignedFlavor {
            flavor: Flavor::from_json(&json).unwrap(),
            signature: String::new(),
        }
    }

    fn group_with(policies: &[(FlavorPart, MatchType, RequiredType)]) -> FlavorGroup {
        FlavorGroup {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            flavor_match_policies: policies
                .iter()
                .map(|&(flavor_part, match_type, required)| FlavorMatchPolicy {
                    flavor_part,
                    match_policy: MatchPolicy {
                        match_type,
                        required,
                    },
                })
                .collect(),
        }
    }

    fn cache_of(flavors: &[&SignedFlavor]) -> HostTrustCache {
        HostTrustCache {
            host_id: Uuid::new_v4(),
            trusted_flavors: flavors.iter().map(|f| (*f).clone()).collect(),
            trust_report: TrustReport::new(HostManifest::default()),
        }
    }

    async fn reqs_for(
        group: &FlavorGroup,
        flavors: &[&SignedFlavor],
        manifest: &HostManifest,
    ) -> FlavorGroupReqs {
        let groups = InMemoryFlavorGroupStore::new();
        let store = InMemoryFlavorStore::new(groups.clone());
        use crate::store::FlavorGroupStore;
        groups.create(group.clone()).await.unwrap();
        for f in flavors {
            store.create((*f).clone()).await.unwrap();
            groups.add_flavors(group.id, &[f.id()]).await.unwrap();
        }
        FlavorGroupReqs::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            group,
            store.as_ref(),
            manifest,
            true,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_of_requires_every_flavor() {
        let group = group_with(&[(
            FlavorPart::Platform,
            MatchType::AllOf,
            RequiredType::Required,
        )]);
        let p1 = signed("PLATFORM", Uuid::new_v4(), "");
        let p2 = signed("PLATFORM", Uuid::new_v4(), "");
        let reqs = reqs_for(&group, &[&p1, &p2], &HostManifest::default()).await;
        let certs = VerifierCerts::default();

        assert!(!reqs.meets_flavor_group_reqs(&cache_of(&[&p1]), &certs));
        assert!(reqs.meets_flavor_group_reqs(&cache_of(&[&p1, &p2]), &certs));
    }

    #[tokio::test]
    async fn test_any_of_requires_one() {
        let group = group_with(&[(
            FlavorPart::Platform,
            MatchType::AnyOf,
            RequiredType::Required,
        )]);
        let p1 = signed("PLATFORM", Uuid::new_v4(), "");
        let p2 = signed("PLATFORM", Uuid::new_v4(), "");
        let reqs = reqs_for(&group, &[&p1, &p2], &HostManifest::default()).await;
        let certs = VerifierCerts::default();

        assert!(!reqs.meets_flavor_group_reqs(&cache_of(&[]), &certs));
        assert!(reqs.meets_flavor_group_reqs(&cache_of(&[&p2]), &certs));
    }

    #[tokio::test]
    async fn test_required_if_defined() {
        let group = group_with(&[(
            FlavorPart::Software,
            MatchType::AnyOf,
            RequiredType::RequiredIfDefined,
        )]);

        // No SOFTWARE flavors and no manifest evidence: not required.
        let reqs = reqs_for(&group, &[], &HostManifest::default()).await;
        assert!(reqs.defined_and_required_parts.is_empty());
        assert!(reqs.meets_flavor_group_reqs(
            &cache_of(&[]),
            &VerifierCerts::default()
        ));

        // One SOFTWARE flavor in the group: required.
        let sw = signed("SOFTWARE", Uuid::new_v4(), "");
        let reqs = reqs_for(&group, &[&sw], &HostManifest::default()).await;
        assert_eq!(reqs.defined_and_required_parts, vec![FlavorPart::Software]);
        assert!(!reqs.meets_flavor_group_reqs(
            &cache_of(&[]),
            &VerifierCerts::default()
        ));
    }

    #[tokio::test]
    async fn test_asset_tag_defined_by_manifest_evidence() {
        let group = group_with(&[(
            FlavorPart::AssetTag,
            MatchType::AnyOf,
            RequiredType::RequiredIfDefined,
        )]);
        let mut manifest = HostManifest::default();
        manifest.asset_tag_digest = vec![0xde, 0xad];
        let reqs = reqs_for(&group, &[], &manifest).await;
        assert_eq!(reqs.defined_and_required_parts, vec![FlavorPart::AssetTag]);
    }

    #[tokio::test]
    async fn test_latest_picks_most_recently_created() {
        let group = group_with(&[(
            FlavorPart::HostUnique,
            MatchType::Latest,
            RequiredType::RequiredIfDefined,
        )]);
        let hw = Uuid::new_v4();
        let older_id = Uuid::new_v4();
        let newer_id = Uuid::new_v4();

        let groups = InMemoryFlavorGroupStore::new();
        let store = InMemoryFlavorStore::new(groups.clone());
        use crate::store::FlavorGroupStore;
        groups.create(group.clone()).await.unwrap();
        for (id, created) in [
            (older_id, "2024-01-01T00:00:00Z"),
            (newer_id, "2025-01-01T00:00:00Z"),
        ] {
            let json = format!(
                r#"{{"meta":{{"id":"{id}","description":{{"flavor_part":"HOST_UNIQUE","hardware_uuid":"{hw}"}},"created":"{created}"}}}}"#
            );
            let signed = SignedFlavor {
                flavor: Flavor::from_json(&json).unwrap(),
                signature: String::new(),
            };
            store.create(signed).await.unwrap();
            groups.add_flavors(group.id, &[id]).await.unwrap();
        }

        let reqs = FlavorGroupReqs::new(
            Uuid::new_v4(),
            hw,
            &group,
            store.as_ref(),
            &HostManifest::default(),
            true,
        )
        .await
        .unwrap();
        assert_eq!(
            reqs.latest_flavors_by_part.get(&FlavorPart::HostUnique),
            Some(&newer_id)
        );
    }

    #[tokio::test]
    async fn test_host_unique_filtered_by_hardware_uuid() {
        let group = group_with(&[(
            FlavorPart::HostUnique,
            MatchType::AnyOf,
            RequiredType::RequiredIfDefined,
        )]);
        let foreign = signed(
            "HOST_UNIQUE",
            Uuid::new_v4(),
            &format!(r#","hardware_uuid":"{}""#, Uuid::new_v4()),
        );
        // The foreign binding must neither define nor satisfy the part.
        let reqs = reqs_for(&group, &[&foreign], &HostManifest::default()).await;
        assert!(reqs.defined_and_required_parts.is_empty());
        assert!(reqs.flavors_by_part.is_empty());
    }
}
