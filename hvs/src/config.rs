// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamlConfig {
    pub issuer_name: String,
    pub validity_seconds: i64,
    /// PKCS#8 PEM file holding the issuer's RSA signing key. A fresh key is
    /// generated when unset.
    pub key_file: Option<PathBuf>,
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            issuer_name: "hvs".to_string(),
            validity_seconds: 86400,
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HvsConfig {
    /// Size of the verification worker pool.
    pub verifiers: usize,
    /// Soft per-job timeout, in seconds.
    pub job_timeout_secs: u64,
    /// Report refresher period, in seconds.
    pub refresh_period_secs: u64,
    /// Total retry budget for fetching host data, in minutes.
    pub host_data_retry_minutes: u64,
    pub skip_flavor_signature_verification: bool,
    /// PEM files with the RSA public keys flavors may be signed with.
    pub flavor_signing_cert_files: Vec<PathBuf>,
    pub saml: SamlConfig,
}

impl Default for HvsConfig {
    fn default() -> Self {
        Self {
            verifiers: 4,
            job_timeout_secs: 300,
            refresh_period_secs: 300,
            host_data_retry_minutes: 5,
            skip_flavor_signature_verification: false,
            flavor_signing_cert_files: Vec::new(),
            saml: SamlConfig::default(),
        }
    }
}

impl HvsConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_secs)
    }

    pub fn host_data_retry_time(&self) -> Duration {
        Duration::from_secs(self.host_data_retry_minutes * 60)
    }
}

pub fn load_config(path: Option<&Path>) -> Result<HvsConfig> {
    match path {
        Some(path) => deserialize_json_file(path),
        None => Ok(HvsConfig::default()),
    }
}

fn deserialize_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HvsConfig::default();
        assert_eq!(config.verifiers, 4);
        assert_eq!(config.host_data_retry_time(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_config_parses() {
        let config: HvsConfig =
            serde_json::from_str(r#"{"verifiers": 2, "saml": {"issuer_name": "hvs.test"}}"#)
                .unwrap();
        assert_eq!(config.verifiers, 2);
        assert_eq!(config.saml.issuer_name, "hvs.test");
        assert_eq!(config.saml.validity_seconds, 86400);
    }
}
