//! TLS listener pool.
//!
//! Each configured endpoint binds its own acceptor. Devices authenticate
//! with client certificates, but the handshake itself admits any chain: the
//! trust decision is made after the handshake by comparing the peer
//! certificate's issuer against the configured issuer, and again at
//! `connect` time when the device claims a serial. A bad certificate only
//! downgrades the session's trust state; it does not close the socket.

use crate::config::ListenerConfig;
use crate::connection::CertState;
use crate::GatewayContext;
use anyhow::{Context, Result};
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DistinguishedName, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use x509_parser::prelude::FromDer;

const DEFAULT_BACKLOG: u32 = 64;

/// Peer-certificate facts captured at handshake time, before the device has
/// claimed a serial.
#[derive(Debug, Clone, Default)]
pub struct CertInfo {
    /// CN of the peer certificate; empty unless the certificate is issued by
    /// the configured issuer.
    pub common_name: String,
    pub state: CertState,
}

// ─── Handshake-permissive client verifier ────────────────────────────────────

/// Requests a client certificate but never fails the handshake over it.
///
/// Chain building against the issuer happens after the handshake (and the
/// result is only a trust downgrade), so the verifier's job is reduced to
/// checking that the client actually holds the key it presented.
#[derive(Debug)]
struct AdmitAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AdmitAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }
}

// ─── PEM loading ─────────────────────────────────────────────────────────────

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("cannot read certificate file {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("invalid PEM in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("cannot read key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("invalid PEM in {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", path.display()))
}

/// The configured issuer, reduced to its subject DN for `issued_by` checks.
#[derive(Debug, Clone)]
pub struct IssuerIdentity {
    subject: String,
}

impl IssuerIdentity {
    /// Load the issuer certificate once at startup. Failure here is fatal
    /// for the listener.
    pub fn load(path: &Path) -> Result<Self> {
        let der = load_certs(path)?;
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der[0].as_ref())
            .map_err(|e| anyhow::anyhow!("issuer certificate does not parse: {e}"))?;
        Ok(Self {
            subject: cert.subject().to_string(),
        })
    }

    /// Inspect a peer certificate chain and place it on the trust ladder.
    pub fn classify_peer(&self, peer_certs: Option<&[CertificateDer<'_>]>) -> CertInfo {
        let Some(cert_der) = peer_certs.and_then(|certs| certs.first()) else {
            return CertInfo {
                common_name: String::new(),
                state: CertState::NoCert,
            };
        };
        let Ok((_, cert)) =
            x509_parser::certificate::X509Certificate::from_der(cert_der.as_ref())
        else {
            return CertInfo {
                common_name: String::new(),
                state: CertState::PresentInvalid,
            };
        };

        if cert.issuer().to_string() != self.subject {
            warn!(
                issuer = %cert.issuer(),
                expected = %self.subject,
                "peer certificate issuer mismatch"
            );
            return CertInfo {
                common_name: String::new(),
                state: CertState::PresentInvalid,
            };
        }

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        CertInfo {
            common_name,
            state: CertState::ValidCa,
        }
    }
}

fn build_server_config(lcfg: &ListenerConfig) -> Result<rustls::ServerConfig> {
    let mut chain = load_certs(&lcfg.cert)?;
    if let Some(extra) = &lcfg.chain {
        chain.extend(load_certs(extra)?);
    }
    let key = load_key(&lcfg.key)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(AdmitAnyClientCert {
        provider: provider.clone(),
    });

    // rustls speaks TLS 1.2+ only, which is exactly the floor we want.
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        .context("TLS protocol selection failed")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .context("server certificate/key rejected")?;
    Ok(config)
}

// ─── Listener ────────────────────────────────────────────────────────────────

/// One bound TLS endpoint and its running accept loop.
pub struct TlsListener {
    pub local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TlsListener {
    /// Bind a configured endpoint and start accepting devices.
    pub async fn bind(ctx: Arc<GatewayContext>, lcfg: &ListenerConfig) -> Result<Self> {
        let issuer = IssuerIdentity::load(&lcfg.issuer)?;
        let tls_config = build_server_config(lcfg)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let addr: SocketAddr = format!("{}:{}", lcfg.address, lcfg.port)
            .parse()
            .with_context(|| format!("bad listener address {}:{}", lcfg.address, lcfg.port))?;
        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(lcfg.backlog.unwrap_or(DEFAULT_BACKLOG))?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            cert = %lcfg.cert.display(),
            key = %lcfg.key.display(),
            "device listener started"
        );

        let handle = tokio::spawn(accept_loop(ctx, listener, acceptor, issuer));
        Ok(Self { local_addr, handle })
    }

    /// Stop accepting new devices. Existing sessions are closed through the
    /// registry.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

async fn accept_loop(
    ctx: Arc<GatewayContext>,
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    issuer: IssuerIdentity,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(err = %e, "accept failed");
                continue;
            }
        };
        debug!(peer = %peer, "accepted TCP connection");

        let ctx = ctx.clone();
        let acceptor = acceptor.clone();
        let issuer = issuer.clone();
        tokio::spawn(async move {
            handshake(ctx, acceptor, issuer, tcp, peer).await;
        });
    }
}

async fn handshake(
    ctx: Arc<GatewayContext>,
    acceptor: TlsAcceptor,
    issuer: IssuerIdentity,
    tcp: TcpStream,
    peer: SocketAddr,
) {
    let tls_stream = match acceptor.accept(tcp).await {
        Ok(s) => s,
        Err(e) => {
            warn!(peer = %peer, err = %e, "TLS handshake failed");
            return;
        }
    };

    let cert = {
        let (_, server_conn) = tls_stream.get_ref();
        issuer.classify_peer(server_conn.peer_certificates())
    };
    match cert.state {
        CertState::NoCert => warn!(peer = %peer, "no peer certificate presented"),
        CertState::PresentInvalid => debug!(peer = %peer, "peer certificate is not valid"),
        _ => debug!(peer = %peer, cn = %cert.common_name, "valid peer certificate"),
    }

    crate::connection::run(ctx, tls_stream, peer, cert).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    fn ca(name: &str) -> (rcgen::Certificate, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        (params.self_signed(&key).unwrap(), key)
    }

    fn device_cert(cn: &str, ca_cert: &rcgen::Certificate, ca_key: &KeyPair) -> CertificateDer<'static> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        let cert = params.signed_by(&key, ca_cert, ca_key).unwrap();
        cert.der().clone()
    }

    fn issuer_for(ca_cert: &rcgen::Certificate) -> IssuerIdentity {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issuer.pem");
        std::fs::write(&path, ca_cert.pem()).unwrap();
        IssuerIdentity::load(&path).unwrap()
    }

    #[test]
    fn classifies_missing_certificate() {
        let (ca_cert, _) = ca("unit-test-ca");
        let issuer = issuer_for(&ca_cert);
        let info = issuer.classify_peer(None);
        assert_eq!(info.state, CertState::NoCert);
        assert!(info.common_name.is_empty());
    }

    #[test]
    fn classifies_issued_certificate_with_cn() {
        let (ca_cert, ca_key) = ca("unit-test-ca");
        let issuer = issuer_for(&ca_cert);
        let dev = device_cert("112233445566", &ca_cert, &ca_key);
        let info = issuer.classify_peer(Some(std::slice::from_ref(&dev)));
        assert_eq!(info.state, CertState::ValidCa);
        assert_eq!(info.common_name, "112233445566");
    }

    #[test]
    fn foreign_issuer_downgrades_to_present_invalid() {
        let (ours, _) = ca("unit-test-ca");
        let (theirs, their_key) = ca("someone-else-ca");
        let issuer = issuer_for(&ours);
        let dev = device_cert("112233445566", &theirs, &their_key);
        let info = issuer.classify_peer(Some(std::slice::from_ref(&dev)));
        assert_eq!(info.state, CertState::PresentInvalid);
        assert!(info.common_name.is_empty());
    }
}
