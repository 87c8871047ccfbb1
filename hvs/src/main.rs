// SPDX-FileCopyrightText: © 2026 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use tracing::{info, warn};

use flavor_verifier::{FlavorVerifier, VerifierCerts};
use hvs_saml::{IssuerConfiguration, SamlReportGenerator};

use hvs::config::{self, HvsConfig};
use hvs::fetcher::{
    FetcherConfig, FileHostConnectorFactory, HostCredentials, HostDataFetcher,
};
use hvs::hosttrust::{
    HostTrustManager, HostTrustService, HostTrustServiceConfig, HostTrustVerifier,
};
use hvs::hrrs::HostReportRefresher;
use hvs::store::memory::{
    InMemoryFlavorGroupStore, InMemoryFlavorStore, InMemoryHostStatusStore, InMemoryHostStore,
    InMemoryQueueStore, InMemoryReportStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "HVS_CONFIG")]
    config: Option<PathBuf>,
}

fn load_saml_issuer(config: &HvsConfig) -> Result<IssuerConfiguration> {
    match &config.saml.key_file {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            IssuerConfiguration::from_key_pem(
                config.saml.issuer_name.clone(),
                config.saml.validity_seconds,
                &pem,
            )
        }
        None => {
            info!("no SAML key configured, generating an ephemeral signing key");
            IssuerConfiguration::with_generated_key(
                config.saml.issuer_name.clone(),
                config.saml.validity_seconds,
            )
        }
    }
}

fn load_flavor_signing_certs(config: &HvsConfig) -> Result<VerifierCerts> {
    let mut keys = Vec::new();
    for path in &config.flavor_signing_cert_files {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        keys.push(
            RsaPublicKey::from_public_key_pem(&pem)
                .with_context(|| format!("failed to parse {}", path.display()))?,
        );
    }
    if keys.is_empty() && !config.skip_flavor_signature_verification {
        warn!("no flavor-signing certificates configured; flavors with signatures cannot verify");
    }
    Ok(VerifierCerts::new(keys))
}

#[tokio::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    let config = config::load_config(args.config.as_deref())?;

    let flavorgroup_store = InMemoryFlavorGroupStore::new();
    let flavor_store = InMemoryFlavorStore::new(flavorgroup_store.clone());
    let host_store = InMemoryHostStore::new(flavorgroup_store.clone());
    let host_status_store = InMemoryHostStatusStore::new();
    let report_store = InMemoryReportStore::new();
    let queue_store = InMemoryQueueStore::new();

    let saml_generator = SamlReportGenerator::new(load_saml_issuer(&config)?);
    let flavor_verifier = FlavorVerifier::new(load_flavor_signing_certs(&config)?);

    let verifier = Arc::new(HostTrustVerifier::new(
        flavor_store,
        flavorgroup_store,
        host_store.clone(),
        report_store.clone(),
        flavor_verifier,
        saml_generator,
        config.skip_flavor_signature_verification,
    ));

    let fetcher = Arc::new(HostDataFetcher::new(
        Arc::new(FileHostConnectorFactory),
        HostCredentials::default(),
        host_store,
        host_status_store.clone(),
        FetcherConfig {
            retry_time: config.host_data_retry_time(),
            ..Default::default()
        },
    ));

    let manager = Arc::new(HostTrustService::new(
        queue_store,
        host_status_store,
        report_store.clone(),
        fetcher,
        verifier,
        HostTrustServiceConfig {
            verifiers: config.verifiers,
            job_timeout: config.job_timeout(),
        },
    ));
    manager.process_queue().await?;

    let refresher = HostReportRefresher::run(
        config.refresh_period(),
        report_store,
        manager.clone() as Arc<dyn HostTrustManager>,
    );

    info!(verifiers = config.verifiers, "host verification service started");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    refresher.stop().await;
    manager.shutdown().await;
    Ok(())
}
