use crate::config::{KeySource, TlsSettings};
use crate::session::TlsInfo;
use anyhow::Context;
use arc_swap::ArcSwap;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;

/// The certificate set served by a listener: a default identity plus
/// per-servername SNI entries.
pub(crate) struct TlsContexts {
    default: Arc<CertifiedKey>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

/// SNI resolver over a swappable context set. `update_tls` replaces
/// the whole map atomically; handshakes in flight keep the set they
/// started with.
pub(crate) struct SniCertResolver {
    contexts: ArcSwap<TlsContexts>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("SniCertResolver").finish()
    }
}

impl SniCertResolver {
    pub fn new(contexts: TlsContexts) -> Self {
        Self {
            contexts: ArcSwap::from_pointee(contexts),
        }
    }

    pub fn replace(&self, contexts: TlsContexts) {
        self.contexts.store(Arc::new(contexts));
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let contexts = self.contexts.load();
        if let Some(name) = client_hello.server_name() {
            if let Some(key) = contexts.by_name.get(&name.to_ascii_lowercase()) {
                return Some(key.clone());
            }
        }
        Some(contexts.default.clone())
    }
}

/// Assemble the context set from configuration. With no certificate
/// configured, a self-signed certificate for `hostname` is generated,
/// as befits a lab listener; production hosts supply PEM material.
pub(crate) async fn build_contexts(
    settings: Option<&TlsSettings>,
    hostname: &str,
) -> anyhow::Result<TlsContexts> {
    let default = match settings {
        Some(TlsSettings {
            certificate: Some(cert),
            private_key: Some(key),
            ..
        }) => load_keypair(cert, key).await?,
        _ => self_signed(hostname)?,
    };

    let mut by_name = HashMap::new();
    if let Some(settings) = settings {
        for (servername, pair) in &settings.sni {
            let key = load_keypair(&pair.certificate, &pair.private_key)
                .await
                .with_context(|| format!("loading SNI material for {servername}"))?;
            by_name.insert(servername.to_ascii_lowercase(), Arc::new(key));
        }
    }

    Ok(TlsContexts {
        default: Arc::new(default),
        by_name,
    })
}

pub(crate) fn server_config(resolver: Arc<SniCertResolver>) -> Arc<ServerConfig> {
    Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver),
    )
}

async fn load_keypair(cert: &KeySource, key: &KeySource) -> anyhow::Result<CertifiedKey> {
    let cert_data = cert.get().await.context("reading certificate")?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_data.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .context("reading PEM encoded certificates")?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found in PEM data");

    let key_data = key.get().await.context("reading private key")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_data.as_slice()))
        .context("reading PEM encoded private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in PEM data"))?;

    let signing = any_supported_type(&key).context("unsupported private key type")?;
    Ok(CertifiedKey::new(certs, signing))
}

fn self_signed(hostname: &str) -> anyhow::Result<CertifiedKey> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .context("generating self-signed certificate")?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing = any_supported_type(&key)?;
    Ok(CertifiedKey::new(vec![cert.der().clone()], signing))
}

/// Summarize the negotiated parameters of a completed handshake.
pub(crate) fn capture_tls_info(conn: &rustls::CommonState) -> TlsInfo {
    TlsInfo {
        protocol: conn
            .protocol_version()
            .map(|v| format!("{v:?}"))
            .unwrap_or_else(|| "unknown".to_string()),
        cipher: conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn self_signed_fallback_builds() {
        let contexts = build_contexts(None, "mx.example.com").await.unwrap();
        assert!(contexts.by_name.is_empty());
        assert_eq!(contexts.default.cert.len(), 1);
    }

    #[tokio::test]
    async fn sni_names_are_lowercased() {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["alt.example.com".to_string()]).unwrap();
        let settings = TlsSettings {
            certificate: None,
            private_key: None,
            sni: HashMap::from([(
                "Alt.Example.Com".to_string(),
                crate::config::TlsKeyPair {
                    certificate: KeySource::Inline { pem: cert.pem() },
                    private_key: KeySource::Inline {
                        pem: key_pair.serialize_pem(),
                    },
                },
            )]),
        };
        let contexts = build_contexts(Some(&settings), "mx.example.com")
            .await
            .unwrap();
        assert!(contexts.by_name.contains_key("alt.example.com"));
    }
}
