// Lifecycle event stream: a websocket to `/1.0/events?type=lifecycle`
// authenticated with the fleet client certificate.

use lxdrunner_common::constants::events::LIFECYCLE;
use lxdrunner_common::{FleetError, LifecycleEvent, RemoteConfig};

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use url::Url;

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    metadata: EventMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct EventMetadata {
    #[serde(default)]
    action: String,
    #[serde(default)]
    source: String,
}

/// Open the lifecycle event stream of the fleet at `base`.
pub async fn subscribe(
    base: &Url,
    remote: &RemoteConfig,
) -> Result<BoxStream<'static, Result<LifecycleEvent, FleetError>>, FleetError> {
    let url = events_url(base).map_err(|e| FleetError::Stream(format!("{:#}", e)))?;
    let tls = tls_config(remote).map_err(|e| FleetError::Stream(format!("{:#}", e)))?;

    let (socket, _) = connect_async_tls_with_config(
        url.as_str(),
        None,
        false,
        Some(Connector::Rustls(Arc::new(tls))),
    )
    .await
    .map_err(|e| FleetError::Stream(e.to_string()))?;

    let events = socket.filter_map(|message| async move {
        match message {
            Ok(Message::Text(text)) => decode_event(&text).map(Ok),
            Ok(Message::Close(_)) => None,
            Ok(_) => None,
            Err(e) => Some(Err(FleetError::Stream(e.to_string()))),
        }
    });
    Ok(events.boxed())
}

/// `wss://` twin of the fleet address, pointing at the lifecycle feed.
fn events_url(base: &Url) -> Result<Url> {
    let mut url = base.join("/1.0/events")?;
    let scheme = match base.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => anyhow::bail!("unsupported fleet scheme {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("cannot use {} for {}", scheme, base))?;
    url.query_pairs_mut().append_pair("type", LIFECYCLE);
    Ok(url)
}

/// Lifecycle event carried by one text frame. Other event types and
/// undecodable frames are skipped.
fn decode_event(text: &str) -> Option<LifecycleEvent> {
    let envelope: EventEnvelope = serde_json::from_str(text).ok()?;
    if envelope.kind != LIFECYCLE || envelope.metadata.action.is_empty() {
        return None;
    }
    Some(LifecycleEvent {
        action: envelope.metadata.action,
        source: envelope.metadata.source,
    })
}

fn tls_config(remote: &RemoteConfig) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;

    let builder = if remote.verify {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    };

    match (&remote.cert, &remote.key) {
        (Some(cert), Some(key)) => {
            let certs = load_certs(cert)?;
            let key = load_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .context("invalid client certificate")
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .with_context(|| format!("reading client certificate {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing client certificate {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificate in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).with_context(|| format!("reading client key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parsing client key {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", path.display()))
}

/// Accepts any server certificate. Fleet endpoints commonly use
/// self-signed certificates; used only when `verify` is off.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
