// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flavor::FlavorPart;
use crate::host::HostManifest;

/// A single reason a rule did not hold. Faults describe "not trusted",
/// never "could not evaluate".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub name: String,
    pub description: String,
}

impl Fault {
    pub fn new(name: &str, description: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInfo {
    pub name: String,
    /// Flavor parts this rule speaks for.
    #[serde(default)]
    pub markers: Vec<FlavorPart>,
}

/// Outcome of one verification rule applied to one flavor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: RuleInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor_id: Option<Uuid>,
    pub trusted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub faults: Vec<Fault>,
}

/// Aggregation of per-rule outcomes for a host, with the evidence embedded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustReport {
    pub host_manifest: HostManifest,
    #[serde(default)]
    pub results: Vec<RuleResult>,
    #[serde(default)]
    pub trusted: bool,
}

impl TrustReport {
    pub fn new(host_manifest: HostManifest) -> Self {
        Self {
            host_manifest,
            results: Vec::new(),
            trusted: false,
        }
    }

    pub fn add_results(&mut self, results: Vec<RuleResult>) {
        self.results.extend(results);
    }

    /// Conjunction of all rule outcomes. Vacuously true for an empty report;
    /// callers gate on `results` being non-empty before relying on it.
    pub fn is_trusted(&self) -> bool {
        self.results.iter().all(|r| r.trusted)
    }
}

/// Persisted, SAML-signed trust report with a validity window. At most one
/// active report exists per host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvsReport {
    pub id: Uuid,
    pub host_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub trust_report: TrustReport,
    pub saml: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(trusted: bool) -> RuleResult {
        RuleResult {
            rule: RuleInfo {
                name: "pcr_matches_constant".to_string(),
                markers: vec![FlavorPart::Platform],
            },
            flavor_id: None,
            trusted,
            faults: Vec::new(),
        }
    }

    #[test]
    fn test_is_trusted_conjunction() {
        let mut report = TrustReport::new(HostManifest::default());
        assert!(report.is_trusted());

        report.add_results(vec![result(true), result(true)]);
        assert!(report.is_trusted());

        report.add_results(vec![result(false)]);
        assert!(!report.is_trusted());
    }
}
