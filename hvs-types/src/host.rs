// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use uuid::Uuid;

use crate::flavor::PcrEx;

/// A registered verification target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub hardware_uuid: Uuid,
    #[serde(default)]
    pub host_name: String,
    pub connection_string: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub flavorgroup_names: Vec<String>,
}

/// PCR hash banks recognised by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcrBank {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl fmt::Display for PcrBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PcrBank::Sha1 => "sha1",
            PcrBank::Sha256 => "sha256",
            PcrBank::Sha384 => "sha384",
            PcrBank::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

/// Identity block reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(rename = "HardwareUUID")]
    pub hardware_uuid: String,
    #[serde(rename = "HostName", default)]
    pub host_name: String,
    #[serde(rename = "OSName", default)]
    pub os_name: String,
    #[serde(rename = "OSVersion", default)]
    pub os_version: String,
    #[serde(rename = "BiosName", default)]
    pub bios_name: String,
    #[serde(rename = "BiosVersion", default)]
    pub bios_version: String,
    #[serde(rename = "ProcessorInfo", default)]
    pub processor_info: String,
}

/// Measured PCR values, per bank and index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PcrManifest {
    pub banks: BTreeMap<PcrBank, BTreeMap<u32, PcrEx>>,
}

impl PcrManifest {
    pub fn pcr(&self, bank: PcrBank, index: u32) -> Option<&PcrEx> {
        self.banks.get(&bank).and_then(|m| m.get(&index))
    }
}

/// Evidence reported by a host. Untrusted input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostManifest {
    #[serde(rename = "HostInfo")]
    pub host_info: HostInfo,
    #[serde(rename = "PcrManifest", default)]
    pub pcr_manifest: PcrManifest,
    #[serde(
        rename = "AssetTagDigest",
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "hex_bytes"
    )]
    pub asset_tag_digest: Vec<u8>,
    #[serde(
        rename = "AIKCertificate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub aik_certificate: Option<String>,
    /// Software measurement roll-ups, keyed by software flavor label.
    #[serde(
        rename = "Measurements",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub measurements: BTreeMap<String, String>,
}

impl HostManifest {
    /// The hardware UUID parsed from the manifest, if present and valid.
    pub fn hardware_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(self.host_info.hardware_uuid.trim())
            .ok()
            .filter(|u| !u.is_nil())
    }
}

/// Connection outcome recorded alongside the last-known manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    #[serde(rename = "CONNECTED")]
    Connected,
    #[serde(rename = "CONNECTION_FAILURE")]
    ConnectionFailure,
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

/// Last-known manifest and connection state for a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatus {
    pub host_id: Uuid,
    pub state: HostState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_manifest: Option<HostManifest>,
    pub created: DateTime<Utc>,
}
