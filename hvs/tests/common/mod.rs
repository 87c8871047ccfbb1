// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the host-trust system tests.
#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use rsa::RsaPrivateKey;
use uuid::Uuid;

use flavor_verifier::{FlavorVerifier, VerifierCerts};
use hvs_saml::{IssuerConfiguration, SamlReportGenerator};
use hvs_types::{
    Flavor, FlavorGroup, FlavorMatchPolicy, FlavorPart, HostManifest, MatchPolicy, MatchType,
    RequiredType, SignedFlavor,
};

use hvs::hosttrust::HostTrustVerifier;
use hvs::store::memory::{
    InMemoryFlavorGroupStore, InMemoryFlavorStore, InMemoryHostStatusStore, InMemoryHostStore,
    InMemoryQueueStore, InMemoryReportStore,
};
use hvs::store::{FlavorGroupStore, FlavorStore, HostStore};

pub struct TestEnv {
    pub flavorgroup_store: Arc<InMemoryFlavorGroupStore>,
    pub flavor_store: Arc<InMemoryFlavorStore>,
    pub host_store: Arc<InMemoryHostStore>,
    pub host_status_store: Arc<InMemoryHostStatusStore>,
    pub report_store: Arc<InMemoryReportStore>,
    pub queue_store: Arc<InMemoryQueueStore>,
    pub verifier: Arc<HostTrustVerifier>,
}

// Key generation dominates test time; every environment shares one key.
fn signing_key() -> RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
        .clone()
}

pub fn test_env() -> TestEnv {
    let flavorgroup_store = InMemoryFlavorGroupStore::new();
    let flavor_store = InMemoryFlavorStore::new(flavorgroup_store.clone());
    let host_store = InMemoryHostStore::new(flavorgroup_store.clone());
    let host_status_store = InMemoryHostStatusStore::new();
    let report_store = InMemoryReportStore::new();
    let queue_store = InMemoryQueueStore::new();

    let saml_generator = SamlReportGenerator::new(IssuerConfiguration::new(
        "hvs.system.test".to_string(),
        3600,
        signing_key(),
    ));

    let verifier = Arc::new(HostTrustVerifier::new(
        flavor_store.clone(),
        flavorgroup_store.clone(),
        host_store.clone(),
        report_store.clone(),
        FlavorVerifier::new(VerifierCerts::default()),
        saml_generator,
        true,
    ));

    TestEnv {
        flavorgroup_store,
        flavor_store,
        host_store,
        host_status_store,
        report_store,
        queue_store,
        verifier,
    }
}

pub fn manifest(hardware_uuid: Uuid, pcr0: &str) -> HostManifest {
    serde_json::from_str(&format!(
        r#"{{
            "HostInfo": {{
                "HardwareUUID": "{hardware_uuid}",
                "OSName": "RedHatEnterprise",
                "OSVersion": "8.1",
                "BiosName": "Intel Corporation",
                "BiosVersion": "SE5C620.86B"
            }},
            "PcrManifest": {{
                "sha256": {{ "0": {{ "value": "{pcr0}" }} }}
            }}
        }}"#
    ))
    .unwrap()
}

pub fn platform_flavor(pcr0: &str) -> SignedFlavor {
    let json = format!(
        r#"{{"meta":{{"id":"{}","description":{{"flavor_part":"PLATFORM"}}}},"pcrs":{{"sha256":{{"0":{{"value":"{pcr0}"}}}}}}}}"#,
        Uuid::new_v4()
    );
    SignedFlavor {
        flavor: Flavor::from_json(&json).unwrap(),
        signature: String::new(),
    }
}

pub fn group(name: &str, policies: &[(FlavorPart, MatchType, RequiredType)]) -> FlavorGroup {
    FlavorGroup {
        id: Uuid::new_v4(),
        name: name.to_string(),
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

/// Register a flavor group with its flavors and enrol a host in it.
pub async fn seed_group(
    env: &TestEnv,
    host_id: Uuid,
    group: FlavorGroup,
    flavors: &[SignedFlavor],
) -> FlavorGroup {
    env.flavorgroup_store.create(group.clone()).await.unwrap();
    for flavor in flavors {
        env.flavor_store.create(flavor.clone()).await.unwrap();
        env.flavorgroup_store
            .add_flavors(group.id, &[flavor.id()])
            .await
            .unwrap();
    }
    env.host_store
        .add_flavorgroups(host_id, &[group.id])
        .await
        .unwrap();
    group
}
