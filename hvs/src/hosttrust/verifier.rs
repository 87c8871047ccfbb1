// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use flavor_verifier::FlavorVerifier;
use hvs_saml::SamlReportGenerator;
use hvs_types::{
    Fault, FlavorPart, HostManifest, HvsReport, RuleInfo, RuleResult, SignedFlavor, TrustReport,
};

use crate::store::{
    FlavorFilter, FlavorGroupFilter, FlavorGroupStore, FlavorStore, HostStore, ReportStore,
    StoreError,
};

use super::requirements::{FlavorGroupReqs, HostTrustCache};

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid host data")]
    InvalidHostManifest,
    #[error("host data missing hardware uuid")]
    ManifestMissingHardwareUuid,
    #[error("store access error: {0}")]
    Store(#[from] StoreError),
    #[error("failed to sign trust report: {0}")]
    Signing(String),
}

/// Orchestrates verification of one host manifest against all the host's
/// flavor groups, re-using the trust cache where it still holds.
///
/// Re-entrant: one instance serves many simultaneous `verify` calls, as long
/// as calls for the same host are serialised by the caller (the trust
/// manager's per-host dedup set does this).
pub struct HostTrustVerifier {
    flavor_store: Arc<dyn FlavorStore>,
    flavorgroup_store: Arc<dyn FlavorGroupStore>,
    host_store: Arc<dyn HostStore>,
    report_store: Arc<dyn ReportStore>,
    flavor_verifier: FlavorVerifier,
    saml_generator: SamlReportGenerator,
    skip_flavor_signature_verification: bool,
}

impl HostTrustVerifier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flavor_store: Arc<dyn FlavorStore>,
        flavorgroup_store: Arc<dyn FlavorGroupStore>,
        host_store: Arc<dyn HostStore>,
        report_store: Arc<dyn ReportStore>,
        flavor_verifier: FlavorVerifier,
        saml_generator: SamlReportGenerator,
        skip_flavor_signature_verification: bool,
    ) -> Self {
        Self {
            flavor_store,
            flavorgroup_store,
            host_store,
            report_store,
            flavor_verifier,
            saml_generator,
            skip_flavor_signature_verification,
        }
    }

    /// Evaluate `host_data` against every flavor group the host belongs to.
    ///
    /// Returns the freshly persisted report, or `None` when the cached
    /// evidence still satisfied every group and no new data forced an
    /// update.
    pub async fn verify(
        &self,
        host_id: Uuid,
        host_data: Option<&HostManifest>,
        new_data: bool,
    ) -> Result<Option<HvsReport>, VerifyError> {
        let host_data = host_data.ok_or(VerifyError::InvalidHostManifest)?;
        let hardware_uuid = host_data
            .hardware_uuid()
            .ok_or(VerifyError::ManifestMissingHardwareUuid)?;

        let flavorgroup_ids = self.host_store.search_flavorgroups(host_id).await?;
        let flavorgroups = self
            .flavorgroup_store
            .search(&FlavorGroupFilter {
                ids: flavorgroup_ids,
                ..Default::default()
            })
            .await?;

        // Presume the persisted evidence is valid until some group falls
        // short of its requirements.
        let mut final_report_valid = true;
        let mut final_report = TrustReport::new(host_data.clone());

        for flavorgroup in &flavorgroups {
            let reqs = FlavorGroupReqs::new(
                host_id,
                hardware_uuid,
                flavorgroup,
                self.flavor_store.as_ref(),
                host_data,
                self.skip_flavor_signature_verification,
            )
            .await?;

            let cached_flavors = self.cached_flavors(host_id, flavorgroup.id).await;
            let trust_cache = if cached_flavors.is_empty() {
                HostTrustCache::empty(host_id, host_data)
            } else {
                self.validate_cached_flavors(host_id, host_data, cached_flavors)
                    .await?
            };

            let group_report;
            if reqs.meets_flavor_group_reqs(&trust_cache, self.flavor_verifier.certs()) {
                group_report = trust_cache.trust_report;
            } else {
                debug!(
                    %host_id,
                    flavorgroup = %flavorgroup.name,
                    "trust cache does not meet flavorgroup requirements"
                );
                final_report_valid = false;
                group_report = self
                    .create_flavorgroup_report(host_id, &reqs, host_data, trust_cache)
                    .await?;
            }
            debug!(
                %host_id,
                flavorgroup = %flavorgroup.name,
                trusted = group_report.is_trusted(),
                "flavorgroup evaluated"
            );
            final_report.add_results(group_report.results);
        }

        // Persist only when there is something to say and either the cached
        // evidence fell short or fresh host data demands a new assertion.
        if !final_report.results.is_empty() && (!final_report_valid || new_data) {
            let saml = self
                .saml_generator
                .generate(host_id, &final_report)
                .map_err(|e| VerifyError::Signing(format!("{e:#}")))?;
            final_report.trusted = final_report.is_trusted();
            let report = HvsReport {
                id: Uuid::new_v4(),
                host_id,
                created_at: saml.created,
                expiration: saml.expiry,
                trust_report: final_report,
                saml: saml.assertion,
            };
            let stored = self.report_store.update(report).await?;
            return Ok(Some(stored));
        }
        Ok(None)
    }

    /// Resolve the trust-cache flavor IDs for `(host, group)` into flavors.
    /// A retrieval failure degrades to an empty cache; stale IDs whose
    /// flavor no longer exists are dropped silently.
    async fn cached_flavors(&self, host_id: Uuid, flavorgroup_id: Uuid) -> Vec<SignedFlavor> {
        let flavor_ids = match self
            .host_store
            .retrieve_trust_cache_flavors(host_id, flavorgroup_id)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                warn!(%host_id, %flavorgroup_id, %err, "trust cache retrieval failed, treating as empty");
                return Vec::new();
            }
        };
        let mut flavors = Vec::with_capacity(flavor_ids.len());
        for flavor_id in flavor_ids {
            match self.flavor_store.retrieve(flavor_id).await {
                Ok(flavor) => flavors.push(flavor),
                Err(_) => debug!(%flavor_id, "cached flavor no longer resolvable, skipping"),
            }
        }
        flavors
    }

    /// Re-verify each cached flavor against the manifest; prune the ones
    /// that no longer match from the host's trust cache.
    async fn validate_cached_flavors(
        &self,
        host_id: Uuid,
        host_data: &HostManifest,
        cached_flavors: Vec<SignedFlavor>,
    ) -> Result<HostTrustCache, VerifyError> {
        let mut cache = HostTrustCache::empty(host_id, host_data);
        let mut to_remove = Vec::new();
        for cached_flavor in cached_flavors {
            let matched = match self.flavor_verifier.verify(
                host_data,
                &cached_flavor,
                self.skip_flavor_signature_verification,
            ) {
                Ok(report) if report.trusted => {
                    cache.trust_report.add_results(report.results);
                    true
                }
                Ok(_) => false,
                Err(err) => {
                    warn!(
                        flavor_id = %cached_flavor.id(),
                        %err,
                        "cached flavor not evaluable, treating as non-match"
                    );
                    false
                }
            };
            if matched {
                cache.trusted_flavors.push(cached_flavor);
            } else {
                to_remove.push(cached_flavor.id());
            }
        }
        if !to_remove.is_empty() {
            if let Err(err) = self
                .host_store
                .remove_trust_cache_flavors(host_id, &to_remove)
                .await
            {
                warn!(%host_id, %err, "failed to prune trust cache");
            }
        }
        Ok(cache)
    }

    /// The cached evidence fell short: look for new matching flavors among
    /// the group's candidates, writing matches through to the trust cache.
    async fn create_flavorgroup_report(
        &self,
        host_id: Uuid,
        reqs: &FlavorGroupReqs,
        host_data: &HostManifest,
        mut cache: HostTrustCache,
    ) -> Result<TrustReport, VerifyError> {
        let missing_parts: Vec<FlavorPart> = reqs
            .defined_and_required_parts
            .iter()
            .copied()
            .filter(|part| !reqs.part_satisfied(*part, &cache))
            .collect();

        let candidates = self
            .flavor_store
            .search(&FlavorFilter {
                flavorgroup_id: Some(reqs.flavorgroup_id),
                flavor_parts: missing_parts,
                hardware_uuid: Some(reqs.hardware_uuid),
                ..Default::default()
            })
            .await?;

        let mut report = TrustReport::new(host_data.clone());
        report.add_results(cache.trust_report.results.clone());

        for candidate in candidates {
            if cache.contains(candidate.id()) {
                continue;
            }
            match self.flavor_verifier.verify(
                host_data,
                &candidate,
                self.skip_flavor_signature_verification,
            ) {
                Ok(candidate_report) if candidate_report.trusted => {
                    self.host_store
                        .add_trust_cache_flavors(host_id, &[candidate.id()])
                        .await?;
                    report.add_results(candidate_report.results);
                    cache.trusted_flavors.push(candidate);
                }
                Ok(candidate_report) => {
                    // Document the failed rule outcomes in the report.
                    report.add_results(candidate_report.results);
                }
                Err(err) => {
                    warn!(
                        flavor_id = %candidate.id(),
                        %err,
                        "candidate flavor not evaluable, recording as untrusted"
                    );
                    report.results.push(RuleResult {
                        rule: RuleInfo {
                            name: "flavor_evaluable".to_string(),
                            markers: candidate.part().into_iter().collect(),
                        },
                        flavor_id: Some(candidate.id()),
                        trusted: false,
                        faults: vec![Fault::new(
                            "flavor_not_evaluable",
                            format!("{err:#}"),
                        )],
                    });
                }
            }
            if reqs.meets_flavor_group_reqs(&cache, self.flavor_verifier.certs()) {
                break;
            }
        }

        report.trusted = reqs.meets_flavor_group_reqs(&cache, self.flavor_verifier.certs())
            && report.is_trusted();
        Ok(report)
    }
}
