// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Flavor verification library
//!
//! Checks a single signed flavor against a host manifest and produces a
//! [`TrustReport`] with one [`RuleResult`] per applied rule. A rule that does
//! not hold yields faults inside its result; errors are reserved for inputs
//! on which no trust determination can be made at all (an undecodable
//! signature, a flavor without a part).

mod rules;

use anyhow::{bail, Context, Result};
use base64::Engine;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::Sha384;
use tracing::debug;

use hvs_types::{HostManifest, SignedFlavor, TrustReport};

pub use rules::rule_names;

/// Known flavor-signing certificates the verifier trusts.
#[derive(Debug, Clone, Default)]
pub struct VerifierCerts {
    pub flavor_signing_keys: Vec<RsaPublicKey>,
}

impl VerifierCerts {
    pub fn new(flavor_signing_keys: Vec<RsaPublicKey>) -> Self {
        Self {
            flavor_signing_keys,
        }
    }

    /// Check the detached signature over the flavor's captured SHA-384
    /// digest. `Ok(false)` means the signature does not verify against any
    /// known key; `Err` means the signature bytes are not evaluable.
    pub fn verify_flavor_signature(&self, signed_flavor: &SignedFlavor) -> Result<bool> {
        if self.flavor_signing_keys.is_empty() {
            bail!("no flavor-signing certificates configured");
        }
        let signature = base64::engine::general_purpose::STANDARD
            .decode(&signed_flavor.signature)
            .context("flavor signature is not valid base64")?;

        let padding = Pkcs1v15Sign::new::<Sha384>();
        let digest = signed_flavor.flavor.digest();
        Ok(self
            .flavor_signing_keys
            .iter()
            .any(|key| key.verify(padding.clone(), digest, &signature).is_ok()))
    }
}

/// Verifies signed flavors against host manifests.
pub struct FlavorVerifier {
    certs: VerifierCerts,
}

impl FlavorVerifier {
    pub fn new(certs: VerifierCerts) -> Self {
        Self { certs }
    }

    pub fn certs(&self) -> &VerifierCerts {
        &self.certs
    }

    /// Apply every rule the flavor implies to the manifest. The returned
    /// report embeds the manifest; its `trusted` bit is the conjunction of
    /// all rule outcomes.
    pub fn verify(
        &self,
        host_manifest: &HostManifest,
        signed_flavor: &SignedFlavor,
        skip_signature: bool,
    ) -> Result<TrustReport> {
        let Some(part) = signed_flavor.part() else {
            bail!(
                "flavor {} does not declare a flavor part",
                signed_flavor.id()
            );
        };

        let mut results = Vec::new();
        if !skip_signature {
            let verified = self.certs.verify_flavor_signature(signed_flavor)?;
            results.push(rules::signature_result(signed_flavor, part, verified));
        }
        results.extend(rules::apply(host_manifest, &signed_flavor.flavor, part));

        let mut report = TrustReport::new(host_manifest.clone());
        report.add_results(results);
        report.trusted = report.is_trusted();
        debug!(
            flavor_id = %signed_flavor.id(),
            part = %part,
            trusted = report.trusted,
            "flavor verified"
        );
        Ok(report)
    }
}
