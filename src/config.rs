// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Listen address, e.g. 127.0.0.1:8080
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// CA certificate PEM path; generated on first start when absent.
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: String,

    /// CA private key PEM path; generated alongside the certificate.
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: String,
}

fn default_ca_cert_path() -> String {
    "ca.crt".to_string()
}

fn default_ca_key_path() -> String {
    "ca.key".to_string()
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: default_ca_cert_path(),
            ca_key_path: default_ca_key_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Upper bound for persisted body copies. Larger bodies still flow
    /// through the proxy intact; the stored copy is cut and marked.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    crate::reqlog::DEFAULT_MAX_CAPTURE_BYTES
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub capture: CaptureConfig,
}

impl Config {
    /// Load configuration from a TOML file. Missing sections fall back to
    /// their defaults.
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let s = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg: Self = toml::from_str(&s)?;
        Ok(cfg)
    }
}
