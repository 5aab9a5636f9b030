use std::{net::IpAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tern_common::config::TlsConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{
        ClientConfig, RootCertStore,
        client::WebPkiServerVerifier,
        crypto::{self, CryptoProvider},
        pki_types::ServerName,
    },
};

use super::{
    TlsInfo,
    verifier::{PeerVerification, PeerVerifier},
};
use crate::{
    dane::TlsaRecord,
    error::{TlsError, TlsResult},
    session::SecuritySession,
};

/// The name the peer's certificate is checked against. Address literals,
/// `[192.0.2.1]` or `[IPv6:2001:db8::1]`, become IP addresses.
fn server_name(host: &str) -> TlsResult<ServerName<'static>> {
    let Some(literal) = host.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) else {
        return ServerName::try_from(host.to_string())
            .map_err(|e| TlsError::InvalidName(format!("{host}: {e}")));
    };

    let address = match literal.split_once(':') {
        Some((tag, address)) if tag.eq_ignore_ascii_case("IPv6") => address,
        _ => literal,
    };
    address
        .parse::<IpAddr>()
        .map(ServerName::from)
        .map_err(|e| TlsError::InvalidName(format!("{host}: {e}")))
}

fn provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(crypto::aws_lc_rs::default_provider()))
}

/// Process wide client TLS state.
///
/// Loading the trust anchors is expensive, so it happens once; every
/// delivery attempt then gets its own handshake with its own DANE
/// expectations via [`ClientTlsContext::connect`].
#[derive(Debug, Clone)]
pub struct ClientTlsContext {
    provider: Arc<CryptoProvider>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    check_pkix: bool,
}

impl ClientTlsContext {
    pub fn new(config: &TlsConfig) -> Self {
        let provider = provider();
        let check_pkix = !config.accept_invalid_certs;

        let mut roots = RootCertStore::empty();
        if check_pkix {
            let certs = rustls_native_certs::load_native_certs();
            let (added, ignored) = roots.add_parsable_certificates(certs.certs);
            tracing::debug!(added, ignored, "Loaded native trust anchors");

            // Log errors but don't fail if some certs couldn't be loaded
            if !certs.errors.is_empty() {
                tracing::warn!(?certs.errors, "Some certificates could not be loaded");
            }
        }

        let webpki = if roots.is_empty() {
            None
        } else {
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .inspect_err(|err| tracing::warn!(%err, "Unable to build certificate verifier"))
                .ok()
        };

        Self {
            provider,
            webpki,
            check_pkix,
        }
    }

    /// Whether peer certificates are checked against the trust anchors
    pub const fn checks_certificates(&self) -> bool {
        self.check_pkix
    }

    /// Performs the client side of a handshake over `stream`.
    ///
    /// `tlsa` carries the destination's usable TLSA records when it is
    /// DANE secured. The handshake only fails on protocol errors; whether
    /// the peer is trustworthy enough is decided afterwards by
    /// [`SecuritySession::enforce`].
    ///
    /// # Errors
    /// - [`TlsError::InvalidName`] if `host` is not usable as a server name
    /// - [`TlsError::Timeout`] when the handshake does not finish in time
    /// - [`TlsError::Handshake`] for any other failure, after which the
    ///   stream is gone
    #[tracing::instrument(level = "debug", skip(self, stream, tlsa), fields(dane = tlsa.is_some()))]
    pub async fn connect<S>(
        &self,
        stream: S,
        host: &str,
        tlsa: Option<&[TlsaRecord]>,
        timeout: Duration,
    ) -> TlsResult<(TlsStream<S>, SecuritySession)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = server_name(host)?;

        let outcome = Arc::new(Mutex::new(PeerVerification::default()));
        let verifier = PeerVerifier {
            webpki: self.webpki.clone(),
            check_pkix: self.check_pkix,
            tlsa: tlsa.map(<[TlsaRecord]>::to_vec),
            provider: Arc::clone(&self.provider),
            outcome: Arc::clone(&outcome),
        };

        let config = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let stream = tokio::time::timeout(timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| TlsError::Timeout(timeout.as_secs()))?
            .map_err(|e| TlsError::Handshake(e.to_string()))?;

        let (_, connection) = stream.get_ref();
        let info = TlsInfo::of(
            connection.protocol_version(),
            connection.negotiated_cipher_suite(),
        );
        let verification = *outcome.lock();

        tracing::debug!(%info, verify = %verification.pkix, dane = %verification.dane, "TLS established");

        Ok((stream, SecuritySession::encrypted(info, verification)))
    }
}
