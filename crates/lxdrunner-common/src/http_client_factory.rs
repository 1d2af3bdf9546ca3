// HttpClientFactory: builds the reqwest clients for the CI provider API and
// the fleet API. Proxy settings come from the usual environment variables,
// which reqwest honours by default.

use crate::config::RemoteConfig;

use anyhow::{Context, Result};
use lxdrunner_sdk::BuildInfo;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, Identity};
use std::fs;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Client for the CI provider REST API, authenticated with the access
    /// token on every request.
    pub fn create_ci_client(pat: &str) -> Result<Client> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("token {}", pat))
            .context("access token contains invalid header characters")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );

        let client = Client::builder()
            .user_agent(BuildInfo::user_agent())
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(client)
    }

    /// Client for the fleet REST API. Presents the configured client
    /// certificate and skips server verification unless `verify` is set.
    pub fn create_fleet_client(remote: &RemoteConfig) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(BuildInfo::user_agent())
            .connect_timeout(CONNECT_TIMEOUT);

        if let Some(pem) = Self::client_identity_pem(remote)? {
            let identity = Identity::from_pem(&pem).context("invalid client certificate")?;
            builder = builder.identity(identity);
        }
        if !remote.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(builder.build()?)
    }

    /// Plain client for downloading release assets. Asset URLs redirect to
    /// a storage host that must not receive the access token.
    pub fn create_download_client() -> Result<Client> {
        let client = Client::builder()
            .user_agent(BuildInfo::user_agent())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(client)
    }

    /// Concatenated certificate and key PEM, when both are configured.
    pub fn client_identity_pem(remote: &RemoteConfig) -> Result<Option<Vec<u8>>> {
        match (&remote.cert, &remote.key) {
            (Some(cert), Some(key)) => {
                let mut pem = fs::read(cert)
                    .with_context(|| format!("reading client certificate {}", cert.display()))?;
                if !pem.ends_with(b"\n") {
                    pem.push(b'\n');
                }
                pem.extend(
                    fs::read(key)
                        .with_context(|| format!("reading client key {}", key.display()))?,
                );
                Ok(Some(pem))
            }
            _ => Ok(None),
        }
    }
}
