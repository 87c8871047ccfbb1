// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use chrono::Utc;
use hvs_types::{
    Fault, Flavor, FlavorPart, HostManifest, RuleInfo, RuleResult, SignedFlavor, MAX_PCR_INDEX,
};

/// Names of every rule this library can emit.
pub mod rule_names {
    pub const FLAVOR_SIGNATURE_VERIFIED: &str = "flavor_signature_verified";
    pub const FLAVOR_VALIDITY_WINDOW: &str = "flavor_validity_window";
    pub const PCR_MATCHES_CONSTANT: &str = "pcr_matches_constant";
    pub const BIOS_INFO_MATCHES: &str = "bios_info_matches";
    pub const OS_INFO_MATCHES: &str = "os_info_matches";
    pub const HOST_UNIQUE_MATCHES: &str = "host_unique_matches";
    pub const ASSET_TAG_MATCHES: &str = "asset_tag_matches";
    pub const SOFTWARE_MEASUREMENTS_MATCH: &str = "software_measurements_match";
}

fn result(name: &str, part: FlavorPart, flavor: &Flavor, faults: Vec<Fault>) -> RuleResult {
    RuleResult {
        rule: RuleInfo {
            name: name.to_string(),
            markers: vec![part],
        },
        flavor_id: Some(flavor.id()),
        trusted: faults.is_empty(),
        faults,
    }
}

pub(crate) fn signature_result(
    signed_flavor: &SignedFlavor,
    part: FlavorPart,
    verified: bool,
) -> RuleResult {
    let faults = if verified {
        Vec::new()
    } else {
        vec![Fault::new(
            "flavor_signature_mismatch",
            format!(
                "signature of flavor {} does not verify against any known flavor-signing certificate",
                signed_flavor.id()
            ),
        )]
    };
    result(
        rule_names::FLAVOR_SIGNATURE_VERIFIED,
        part,
        &signed_flavor.flavor,
        faults,
    )
}

/// Apply every content rule the flavor implies for its part.
pub(crate) fn apply(manifest: &HostManifest, flavor: &Flavor, part: FlavorPart) -> Vec<RuleResult> {
    let mut results = Vec::new();

    if flavor.validity.is_some() {
        results.push(validity_window(flavor, part));
    }
    results.extend(pcr_matches(manifest, flavor, part));

    match part {
        FlavorPart::Platform => {
            if flavor.bios.is_some() {
                results.push(bios_info(manifest, flavor, part));
            }
        }
        FlavorPart::Os => results.push(os_info(manifest, flavor, part)),
        FlavorPart::HostUnique => results.push(host_unique(manifest, flavor, part)),
        FlavorPart::AssetTag => results.push(asset_tag(manifest, flavor, part)),
        FlavorPart::Software => results.push(software_measurements(manifest, flavor, part)),
    }

    results
}

fn validity_window(flavor: &Flavor, part: FlavorPart) -> RuleResult {
    let mut faults = Vec::new();
    if let Some(validity) = &flavor.validity {
        let now = Utc::now();
        if now < validity.not_before {
            faults.push(Fault::new(
                "flavor_not_yet_valid",
                format!("flavor is not valid before {}", validity.not_before),
            ));
        }
        if now > validity.not_after {
            faults.push(Fault::new(
                "flavor_expired",
                format!("flavor expired at {}", validity.not_after),
            ));
        }
    }
    result(rule_names::FLAVOR_VALIDITY_WINDOW, part, flavor, faults)
}

fn pcr_matches(manifest: &HostManifest, flavor: &Flavor, part: FlavorPart) -> Vec<RuleResult> {
    let mut results = Vec::new();
    for (bank, indices) in &flavor.pcrs {
        for (index, expected) in indices {
            let mut faults = Vec::new();
            if *index > MAX_PCR_INDEX {
                faults.push(Fault::new(
                    "pcr_index_invalid",
                    format!("PCR index {index} is outside the valid range 0..={MAX_PCR_INDEX}"),
                ));
                results.push(result(rule_names::PCR_MATCHES_CONSTANT, part, flavor, faults));
                continue;
            }
            match manifest.pcr_manifest.pcr(*bank, *index) {
                None => faults.push(Fault::new(
                    "pcr_value_missing",
                    format!("host manifest reports no {bank} PCR {index}"),
                )),
                Some(measured) => {
                    if measured.value != expected.value {
                        faults.push(Fault::new(
                            "pcr_value_mismatch",
                            format!(
                                "{bank} PCR {index} is {}, expected {}",
                                hex::encode(&measured.value),
                                hex::encode(&expected.value),
                            ),
                        ));
                    }
                    // Event-log expectations only apply when the host
                    // reported an event log for this PCR.
                    if !expected.event.is_empty() && !measured.event.is_empty() {
                        let measured_digests: Vec<&[u8]> =
                            measured.event.iter().map(|e| e.digest.as_slice()).collect();
                        let expected_digests: Vec<&[u8]> =
                            expected.event.iter().map(|e| e.digest.as_slice()).collect();
                        if measured_digests != expected_digests {
                            faults.push(Fault::new(
                                "pcr_event_log_mismatch",
                                format!("{bank} PCR {index} event log diverges from expectation"),
                            ));
                        }
                    }
                }
            }
            results.push(result(rule_names::PCR_MATCHES_CONSTANT, part, flavor, faults));
        }
    }
    results
}

fn bios_info(manifest: &HostManifest, flavor: &Flavor, part: FlavorPart) -> RuleResult {
    let mut faults = Vec::new();
    if let Some(bios) = &flavor.bios {
        if manifest.host_info.bios_name != bios.bios_name {
            faults.push(Fault::new(
                "bios_name_mismatch",
                format!(
                    "host BIOS name {:?} does not match expected {:?}",
                    manifest.host_info.bios_name, bios.bios_name
                ),
            ));
        }
        if manifest.host_info.bios_version != bios.bios_version {
            faults.push(Fault::new(
                "bios_version_mismatch",
                format!(
                    "host BIOS version {:?} does not match expected {:?}",
                    manifest.host_info.bios_version, bios.bios_version
                ),
            ));
        }
    }
    result(rule_names::BIOS_INFO_MATCHES, part, flavor, faults)
}

fn os_info(manifest: &HostManifest, flavor: &Flavor, part: FlavorPart) -> RuleResult {
    let mut faults = Vec::new();
    let description = &flavor.meta.description;
    if let Some(os_name) = &description.os_name {
        if &manifest.host_info.os_name != os_name {
            faults.push(Fault::new(
                "os_name_mismatch",
                format!(
                    "host OS name {:?} does not match expected {:?}",
                    manifest.host_info.os_name, os_name
                ),
            ));
        }
    }
    if let Some(os_version) = &description.os_version {
        if &manifest.host_info.os_version != os_version {
            faults.push(Fault::new(
                "os_version_mismatch",
                format!(
                    "host OS version {:?} does not match expected {:?}",
                    manifest.host_info.os_version, os_version
                ),
            ));
        }
    }
    result(rule_names::OS_INFO_MATCHES, part, flavor, faults)
}

fn host_unique(manifest: &HostManifest, flavor: &Flavor, part: FlavorPart) -> RuleResult {
    let mut faults = Vec::new();
    match (flavor.meta.description.hardware_uuid, manifest.hardware_uuid()) {
        (Some(expected), Some(actual)) if expected == actual => {}
        (Some(expected), actual) => faults.push(Fault::new(
            "hardware_uuid_mismatch",
            format!("host hardware UUID {actual:?} does not match flavor binding {expected}"),
        )),
        (None, _) => faults.push(Fault::new(
            "hardware_uuid_missing",
            "host-unique flavor carries no hardware UUID binding",
        )),
    }
    result(rule_names::HOST_UNIQUE_MATCHES, part, flavor, faults)
}

fn asset_tag(manifest: &HostManifest, flavor: &Flavor, part: FlavorPart) -> RuleResult {
    let mut faults = Vec::new();
    match &flavor.external {
        None => faults.push(Fault::new(
            "asset_tag_expectation_missing",
            "asset-tag flavor carries no external section",
        )),
        Some(external) => {
            if manifest.asset_tag_digest.is_empty() {
                faults.push(Fault::new(
                    "asset_tag_missing",
                    "host manifest carries no asset-tag digest",
                ));
            } else if manifest.asset_tag_digest != external.asset_tag.tag_digest {
                faults.push(Fault::new(
                    "asset_tag_mismatch",
                    format!(
                        "host asset tag {} does not match expected {}",
                        hex::encode(&manifest.asset_tag_digest),
                        hex::encode(&external.asset_tag.tag_digest),
                    ),
                ));
            }
        }
    }
    result(rule_names::ASSET_TAG_MATCHES, part, flavor, faults)
}

fn software_measurements(manifest: &HostManifest, flavor: &Flavor, part: FlavorPart) -> RuleResult {
    let mut faults = Vec::new();
    match &flavor.software {
        None => faults.push(Fault::new(
            "software_expectation_missing",
            "software flavor carries no software section",
        )),
        Some(software) => {
            let label = flavor.meta.description.label.as_deref().unwrap_or_default();
            match manifest.measurements.get(label) {
                None => faults.push(Fault::new(
                    "software_measurement_missing",
                    format!("host manifest reports no measurement for software {label:?}"),
                )),
                Some(measured) => {
                    if measured != &hex::encode(&software.cumulative_hash) {
                        faults.push(Fault::new(
                            "software_measurement_mismatch",
                            format!(
                                "cumulative hash for software {label:?} is {measured}, expected {}",
                                hex::encode(&software.cumulative_hash),
                            ),
                        ));
                    }
                }
            }
        }
    }
    result(rule_names::SOFTWARE_MEASUREMENTS_MATCH, part, flavor, faults)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlavorVerifier, VerifierCerts};
    use base64::Engine;
    use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
    use sha2::Sha384;
    use uuid::Uuid;

    const HW_UUID: &str = "8d790fb9-ba6a-4a70-8ca4-b5b6b5b96fce";

    fn manifest() -> HostManifest {
        serde_json::from_str(&format!(
            r#"{{
                "HostInfo": {{
                    "HardwareUUID": "{HW_UUID}",
                    "OSName": "RedHatEnterprise",
                    "OSVersion": "8.1",
                    "BiosName": "Intel Corporation",
                    "BiosVersion": "SE5C620.86B"
                }},
                "PcrManifest": {{
                    "sha256": {{ "0": {{ "value": "00aa" }}, "7": {{ "value": "ff01" }} }}
                }},
                "AssetTagDigest": "deadbeef"
            }}"#
        ))
        .unwrap()
    }

    fn platform_flavor(pcr0: &str) -> SignedFlavor {
        let json = format!(
            r#"{{"flavor":{{"meta":{{"id":"{}","description":{{"flavor_part":"PLATFORM"}}}},"bios":{{"bios_name":"Intel Corporation","bios_version":"SE5C620.86B"}},"pcrs":{{"sha256":{{"0":{{"value":"{pcr0}"}}}}}}}},"signature":""}}"#,
            Uuid::new_v4()
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_platform_flavor_matches() {
        let verifier = FlavorVerifier::new(VerifierCerts::default());
        let report = verifier
            .verify(&manifest(), &platform_flavor("00aa"), true)
            .unwrap();
        assert!(report.trusted);
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.faults.is_empty()));
    }

    #[test]
    fn test_pcr_mismatch_is_fault_not_error() {
        let verifier = FlavorVerifier::new(VerifierCerts::default());
        let report = verifier
            .verify(&manifest(), &platform_flavor("0bad"), true)
            .unwrap();
        assert!(!report.trusted);
        let pcr_result = report
            .results
            .iter()
            .find(|r| r.rule.name == rule_names::PCR_MATCHES_CONSTANT)
            .unwrap();
        assert!(!pcr_result.trusted);
        assert_eq!(pcr_result.faults[0].name, "pcr_value_mismatch");
    }

    #[test]
    fn test_missing_pcr_bank_is_fault() {
        let json = format!(
            r#"{{"flavor":{{"meta":{{"id":"{}","description":{{"flavor_part":"PLATFORM"}}}},"pcrs":{{"sha384":{{"0":{{"value":"00aa"}}}}}}}},"signature":""}}"#,
            Uuid::new_v4()
        );
        let flavor: SignedFlavor = serde_json::from_str(&json).unwrap();
        let verifier = FlavorVerifier::new(VerifierCerts::default());
        let report = verifier.verify(&manifest(), &flavor, true).unwrap();
        assert!(!report.trusted);
        assert_eq!(report.results[0].faults[0].name, "pcr_value_missing");
    }

    #[test]
    fn test_out_of_range_pcr_index_is_fault() {
        let json = format!(
            r#"{{"flavor":{{"meta":{{"id":"{}","description":{{"flavor_part":"PLATFORM"}}}},"pcrs":{{"sha256":{{"42":{{"value":"00aa"}}}}}}}},"signature":""}}"#,
            Uuid::new_v4()
        );
        let flavor: SignedFlavor = serde_json::from_str(&json).unwrap();
        let verifier = FlavorVerifier::new(VerifierCerts::default());
        let report = verifier.verify(&manifest(), &flavor, true).unwrap();
        assert!(!report.trusted);
        assert_eq!(report.results[0].faults[0].name, "pcr_index_invalid");
    }

    #[test]
    fn test_asset_tag_rules() {
        let verifier = FlavorVerifier::new(VerifierCerts::default());
        let json = format!(
            r#"{{"flavor":{{"meta":{{"id":"{}","description":{{"flavor_part":"ASSET_TAG","hardware_uuid":"{HW_UUID}"}}}},"external":{{"asset_tag":{{"tag_digest":"deadbeef","hardware_uuid":"{HW_UUID}"}}}}}},"signature":""}}"#,
            Uuid::new_v4()
        );
        let flavor: SignedFlavor = serde_json::from_str(&json).unwrap();
        let report = verifier.verify(&manifest(), &flavor, true).unwrap();
        assert!(report.trusted);

        // Same flavor against a manifest without tag evidence.
        let mut untagged = manifest();
        untagged.asset_tag_digest.clear();
        let report = verifier.verify(&untagged, &flavor, true).unwrap();
        assert!(!report.trusted);
        let tag_result = report
            .results
            .iter()
            .find(|r| r.rule.name == rule_names::ASSET_TAG_MATCHES)
            .unwrap();
        assert_eq!(tag_result.faults[0].name, "asset_tag_missing");
    }

    #[test]
    fn test_host_unique_binding() {
        let verifier = FlavorVerifier::new(VerifierCerts::default());
        let other = Uuid::new_v4();
        let json = format!(
            r#"{{"flavor":{{"meta":{{"id":"{}","description":{{"flavor_part":"HOST_UNIQUE","hardware_uuid":"{other}"}}}}}},"signature":""}}"#,
            Uuid::new_v4()
        );
        let flavor: SignedFlavor = serde_json::from_str(&json).unwrap();
        let report = verifier.verify(&manifest(), &flavor, true).unwrap();
        assert!(!report.trusted);
    }

    #[test]
    fn test_signature_verification_round_trip() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        let mut signed = platform_flavor("00aa");
        let signature = private_key
            .sign(Pkcs1v15Sign::new::<Sha384>(), signed.flavor.digest())
            .unwrap();
        signed.signature = base64::engine::general_purpose::STANDARD.encode(signature);

        let verifier = FlavorVerifier::new(VerifierCerts::new(vec![public_key]));
        let report = verifier.verify(&manifest(), &signed, false).unwrap();
        assert!(report.trusted);

        // Tampering with the signed bytes must surface as a fault.
        let mut tampered = signed.clone();
        tampered.signature = base64::engine::general_purpose::STANDARD.encode([0u8; 256]);
        let report = verifier.verify(&manifest(), &tampered, false).unwrap();
        assert!(!report.trusted);
        assert_eq!(report.results[0].faults[0].name, "flavor_signature_mismatch");
    }
}
