// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Certificate authority and on-the-fly leaf certificate minting.
//!
//! During a CONNECT tunnel handshake the TLS server resolves its certificate
//! through [`CertificateAuthority::mint`], which signs a short-lived leaf for
//! the requested name (the ClientHello SNI, falling back to the CONNECT
//! host). Leaves are cached per host and regenerated when absent or expired.

use anyhow::{anyhow, Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    SanType, PKCS_ECDSA_P256_SHA256,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{Certificate as RustlsCertificate, PrivateKey, ServerConfig};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::{error, info};

/// Leaf validity window.
const LEAF_TTL: Duration = Duration::hours(24);
/// Backdate `not_before` to tolerate client clock skew.
const NOT_BEFORE_OFFSET: Duration = Duration::seconds(60);
/// Re-mint leaves this close to expiry.
const EXPIRY_MARGIN: Duration = Duration::minutes(5);

struct MintedLeaf {
    certified: Arc<CertifiedKey>,
    not_after: OffsetDateTime,
}

/// Holds the CA keypair and a cache of minted leaf certificates by host.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    /// The CA certificate object used for signing leaves.
    ca_cert: Certificate,
    cache: RwLock<HashMap<String, MintedLeaf>>,
}

impl CertificateAuthority {
    /// Loads the CA from the given paths, or generates and persists a new
    /// one when the files don't exist.
    pub async fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        if cert_path.exists() && key_path.exists() {
            info!("loading existing CA from {:?}", cert_path);
            Self::load(cert_path, key_path).await
        } else {
            info!("generating new CA at {:?}", cert_path);
            Self::generate_and_save(cert_path, key_path).await
        }
    }

    async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .context("failed to read CA cert")?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .context("failed to read CA key")?;

        let key_pair =
            KeyPair::from_pem(&key_pem).context("failed to parse CA key pair from PEM")?;

        let mut params = ca_params();
        params.key_pair = Some(key_pair);
        let ca_cert = Certificate::from_params(params)?;

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            ca_cert,
            cache: RwLock::new(HashMap::new()),
        }))
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert = Certificate::from_params(ca_params())?;
        let cert_pem = cert.serialize_pem()?;
        let key_pem = cert.serialize_private_key_pem();

        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(cert_path, &cert_pem).await?;
        fs::write(key_path, &key_pem).await?;

        Ok(Arc::new(Self {
            ca_cert_pem: cert_pem,
            ca_cert: cert,
            cache: RwLock::new(HashMap::new()),
        }))
    }

    /// Mints (or returns a cached, still-valid) leaf certificate for the
    /// given DNS name or IP literal, signed by this CA. The SAN covers
    /// exactly `host`; no implicit wildcards.
    pub fn mint(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        let now = OffsetDateTime::now_utc();

        {
            let cache = self.cache.read().unwrap();
            if let Some(leaf) = cache.get(host) {
                if leaf.not_after > now + EXPIRY_MARGIN {
                    return Ok(leaf.certified.clone());
                }
            }
        }

        let not_after = now + LEAF_TTL;

        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.to_string()),
        }];
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, host);
        params.use_authority_key_identifier_extension = false;
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.not_before = now - NOT_BEFORE_OFFSET;
        params.not_after = not_after;

        let cert = Certificate::from_params(params)?;
        let cert_pem = cert.serialize_pem_with_signer(&self.ca_cert)?;
        let key_pem = cert.serialize_private_key_pem();

        let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())?;
        let leaf_cert = RustlsCertificate(
            certs
                .into_iter()
                .next()
                .context("no certificate in minted PEM")?,
        );

        let keys = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())?;
        let leaf_key = PrivateKey(
            keys.into_iter()
                .next()
                .context("no private key in minted PEM")?,
        );
        let signing_key = rustls::sign::any_supported_type(&leaf_key)
            .map_err(|e| anyhow!("unsupported leaf key: {e:?}"))?;

        let certified = Arc::new(CertifiedKey::new(vec![leaf_cert], signing_key));

        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(
                host.to_string(),
                MintedLeaf {
                    certified: certified.clone(),
                    not_after,
                },
            );
        }

        Ok(certified)
    }

    /// TLS server config for a CONNECT tunnel: the certificate is resolved
    /// per handshake from the ClientHello SNI, with `fallback_host` (the
    /// CONNECT authority) used when the client sends no SNI.
    ///
    /// The fallback leaf is minted eagerly so mint failures surface to the
    /// CONNECT handler instead of a silent handshake failure.
    pub fn sni_server_config(self: Arc<Self>, fallback_host: String) -> Result<Arc<ServerConfig>> {
        self.mint(&fallback_host)?;

        let resolver = SniCertResolver {
            ca: self,
            fallback_host,
        };
        let mut config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }

    pub fn ca_cert_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }

    /// Force every cached leaf past its expiry margin.
    #[cfg(test)]
    fn expire_all(&self) {
        let mut cache = self.cache.write().unwrap();
        for leaf in cache.values_mut() {
            leaf.not_after = OffsetDateTime::now_utc() - Duration::hours(1);
        }
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "intercept-http CA");
    params
        .distinguished_name
        .push(DnType::OrganizationName, "intercept-http");
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params
}

struct SniCertResolver {
    ca: Arc<CertificateAuthority>,
    fallback_host: String,
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let host = client_hello
            .server_name()
            .unwrap_or(self.fallback_host.as_str());
        match self.ca.mint(host) {
            Ok(certified) => Some(certified),
            Err(err) => {
                error!(%host, %err, "failed to mint leaf certificate");
                None
            }
        }
    }
}
