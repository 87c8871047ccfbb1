// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_human_bytes as hex_bytes;
use serde_json::value::RawValue;
use sha2::{Digest, Sha384};
use uuid::Uuid;

use crate::host::PcrBank;

/// The dimension of the host a flavor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FlavorPart {
    #[serde(rename = "PLATFORM")]
    Platform,
    #[serde(rename = "OS")]
    Os,
    #[serde(rename = "HOST_UNIQUE")]
    HostUnique,
    #[serde(rename = "ASSET_TAG")]
    AssetTag,
    #[serde(rename = "SOFTWARE")]
    Software,
}

impl FlavorPart {
    /// All parts in canonical order.
    pub const ALL: [FlavorPart; 5] = [
        FlavorPart::Platform,
        FlavorPart::Os,
        FlavorPart::HostUnique,
        FlavorPart::AssetTag,
        FlavorPart::Software,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlavorPart::Platform => "PLATFORM",
            FlavorPart::Os => "OS",
            FlavorPart::HostUnique => "HOST_UNIQUE",
            FlavorPart::AssetTag => "ASSET_TAG",
            FlavorPart::Software => "SOFTWARE",
        }
    }

    /// Parts whose flavors are bound to a single host by hardware UUID.
    pub fn is_host_specific(&self) -> bool {
        matches!(self, FlavorPart::HostUnique | FlavorPart::AssetTag)
    }
}

impl fmt::Display for FlavorPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form description carried in the flavor meta section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlavorDescription {
    pub flavor_part: Option<FlavorPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// Set on HOST_UNIQUE and ASSET_TAG flavors only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_uuid: Option<Uuid>,
}

/// Meta section, mandatory for all flavor parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorMeta {
    pub id: Uuid,
    pub description: FlavorDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bios {
    pub bios_name: String,
    pub bios_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareFeatures {
    #[serde(default)]
    pub tpm: bool,
    #[serde(default)]
    pub txt: bool,
}

/// Hardware section, unique to PLATFORM flavors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hardware {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor_info: Option<String>,
    #[serde(default)]
    pub feature: HardwareFeatures,
}

/// One expected event-log entry behind a PCR value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrEventEntry {
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    #[serde(default)]
    pub label: String,
}

/// Expected PCR value plus optional event-log expectations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrEx {
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event: Vec<PcrEventEntry>,
}

impl PcrEx {
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            value,
            event: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetTag {
    #[serde(with = "hex_bytes")]
    pub tag_digest: Vec<u8>,
    pub hardware_uuid: Uuid,
}

/// External section, unique to ASSET_TAG flavors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct External {
    pub asset_tag: AssetTag,
}

/// Software section: named measurements plus their cumulative hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Software {
    #[serde(default)]
    pub measurements: BTreeMap<String, String>,
    #[serde(with = "hex_bytes")]
    pub cumulative_hash: Vec<u8>,
}

/// The serialized body of a flavor. `Flavor` wraps this together with the
/// digest of the exact JSON bytes it was parsed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorContent {
    pub meta: FlavorMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity: Option<Validity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bios: Option<Bios>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pcrs: BTreeMap<PcrBank, BTreeMap<u32, PcrEx>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<External>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software: Option<Software>,
}

/// A standardized set of expectations that determines what platform
/// measurements are considered trusted.
///
/// The SHA-384 digest of the originating JSON is captured eagerly when the
/// flavor is deserialized, so that a detached signature can later be checked
/// against the exact bytes that arrived on the wire.
#[derive(Debug, Clone)]
pub struct Flavor {
    content: FlavorContent,
    digest: Vec<u8>,
}

impl Flavor {
    /// Build a flavor from parts; the digest is taken over the canonical
    /// serialization of the content.
    pub fn new(content: FlavorContent) -> Self {
        let json = serde_json::to_vec(&content).unwrap_or_default();
        let digest = Sha384::digest(&json).to_vec();
        Self { content, digest }
    }

    /// Parse a flavor from its wire JSON, capturing the digest of the exact
    /// input bytes.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let content: FlavorContent = serde_json::from_str(json)?;
        Ok(Self {
            content,
            digest: Sha384::digest(json.as_bytes()).to_vec(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.content.meta.id
    }

    pub fn part(&self) -> Option<FlavorPart> {
        self.content.meta.description.flavor_part
    }

    /// SHA-384 digest of the flavor's source JSON.
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Expected PCR value at `bank`, `index`, if the flavor pins one.
    pub fn pcr_value(&self, bank: PcrBank, index: u32) -> Option<&PcrEx> {
        self.content.pcrs.get(&bank).and_then(|m| m.get(&index))
    }
}

impl std::ops::Deref for Flavor {
    type Target = FlavorContent;

    fn deref(&self) -> &Self::Target {
        &self.content
    }
}

impl Serialize for Flavor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.content.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Flavor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Route through RawValue so the digest covers the exact source bytes
        // rather than a re-serialization.
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Flavor::from_json(raw.get()).map_err(serde::de::Error::custom)
    }
}

/// A flavor plus a detached signature over its digest, verifiable against a
/// known flavor-signing certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedFlavor {
    pub flavor: Flavor,
    /// Base64 of an RSA PKCS#1 v1.5 signature over the SHA-384 flavor digest.
    pub signature: String,
}

impl SignedFlavor {
    pub fn id(&self) -> Uuid {
        self.flavor.id()
    }

    pub fn part(&self) -> Option<FlavorPart> {
        self.flavor.part()
    }
}
