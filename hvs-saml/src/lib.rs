// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! SAML report generation
//!
//! Renders a [`TrustReport`] as a SAML 2.0 assertion bound to a validity
//! window and enveloped-signs it with the issuer's RSA key (PKCS#1 v1.5,
//! SHA-384). The verifier persists the assertion text alongside the report;
//! a report that cannot be signed is never persisted.

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha384};
use tracing::debug;
use uuid::Uuid;

use hvs_types::{FlavorPart, TrustReport};

/// SAML issuer identity and signing material.
pub struct IssuerConfiguration {
    pub issuer_name: String,
    pub validity_seconds: i64,
    signing_key: RsaPrivateKey,
}

impl IssuerConfiguration {
    pub fn new(issuer_name: String, validity_seconds: i64, signing_key: RsaPrivateKey) -> Self {
        Self {
            issuer_name,
            validity_seconds,
            signing_key,
        }
    }

    /// Load the signing key from a PKCS#8 PEM document.
    pub fn from_key_pem(issuer_name: String, validity_seconds: i64, pem: &str) -> Result<Self> {
        let signing_key =
            RsaPrivateKey::from_pkcs8_pem(pem).context("failed to load SAML signing key")?;
        Ok(Self::new(issuer_name, validity_seconds, signing_key))
    }

    /// Generate a fresh signing key. Meant for first-boot setups without
    /// provisioned key material.
    pub fn with_generated_key(issuer_name: String, validity_seconds: i64) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let signing_key =
            RsaPrivateKey::new(&mut rng, 3072).context("failed to generate SAML signing key")?;
        Ok(Self::new(issuer_name, validity_seconds, signing_key))
    }
}

/// A signed assertion and the validity window it covers.
#[derive(Debug, Clone)]
pub struct SamlAssertion {
    pub assertion: String,
    pub created: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

pub struct SamlReportGenerator {
    issuer: IssuerConfiguration,
}

impl SamlReportGenerator {
    pub fn new(issuer: IssuerConfiguration) -> Self {
        Self { issuer }
    }

    /// Produce a signed assertion binding the host identity, the overall
    /// trusted bit and the per-part outcomes of `report`.
    pub fn generate(&self, host_id: Uuid, report: &TrustReport) -> Result<SamlAssertion> {
        let created = Utc::now();
        let expiry = created + Duration::seconds(self.issuer.validity_seconds);

        let body = self.assertion_body(host_id, report, created, expiry);
        let digest = Sha384::digest(body.as_bytes());
        let signature = self
            .issuer
            .signing_key
            .sign(Pkcs1v15Sign::new::<Sha384>(), &digest)
            .context("failed to sign SAML assertion")?;
        let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature);

        let assertion = format!(
            "{body}<saml:Signature Algorithm=\"http://www.w3.org/2001/04/xmldsig-more#rsa-sha384\">{signature_b64}</saml:Signature></saml:Assertion>"
        );
        debug!(%host_id, %expiry, "generated SAML assertion");
        Ok(SamlAssertion {
            assertion,
            created,
            expiry,
        })
    }

    fn assertion_body(
        &self,
        host_id: Uuid,
        report: &TrustReport,
        created: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> String {
        let host_info = &report.host_manifest.host_info;
        let mut attributes = vec![
            ("HostId", host_id.to_string()),
            ("HardwareUUID", host_info.hardware_uuid.clone()),
            ("HostName", host_info.host_name.clone()),
            ("OSName", host_info.os_name.clone()),
            ("OSVersion", host_info.os_version.clone()),
            ("BiosName", host_info.bios_name.clone()),
            ("BiosVersion", host_info.bios_version.clone()),
            ("TRUST_OVERALL", report.is_trusted().to_string()),
        ];
        for part in FlavorPart::ALL {
            let part_results: Vec<_> = report
                .results
                .iter()
                .filter(|r| r.rule.markers.contains(&part))
                .collect();
            if part_results.is_empty() {
                continue;
            }
            let trusted = part_results.iter().all(|r| r.trusted);
            attributes.push((
                match part {
                    FlavorPart::Platform => "TRUST_PLATFORM",
                    FlavorPart::Os => "TRUST_OS",
                    FlavorPart::HostUnique => "TRUST_HOST_UNIQUE",
                    FlavorPart::AssetTag => "TRUST_ASSET_TAG",
                    FlavorPart::Software => "TRUST_SOFTWARE",
                },
                trusted.to_string(),
            ));
        }

        let rendered: String = attributes
            .iter()
            .map(|(name, value)| {
                format!(
                    "<saml:Attribute Name=\"{}\"><saml:AttributeValue>{}</saml:AttributeValue></saml:Attribute>",
                    name,
                    xml_escape(value)
                )
            })
            .collect();

        format!(
            "<saml:Assertion xmlns:saml=\"urn:oasis:names:tc:SAML:2.0:assertion\" ID=\"_{id}\" IssueInstant=\"{created}\"><saml:Issuer>{issuer}</saml:Issuer><saml:Conditions NotBefore=\"{created}\" NotOnOrAfter=\"{expiry}\"/><saml:AttributeStatement>{rendered}</saml:AttributeStatement>",
            id = Uuid::new_v4(),
            created = created.to_rfc3339(),
            expiry = expiry.to_rfc3339(),
            issuer = xml_escape(&self.issuer.issuer_name),
        )
    }
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
