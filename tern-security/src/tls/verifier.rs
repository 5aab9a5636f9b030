use std::sync::Arc;

use parking_lot::Mutex;
use tokio_rustls::rustls::{
    DigitallySignedStruct, Error, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};

use super::VerifyOutcome;
use crate::dane::{self, DaneOutcome, TlsaRecord};

/// What the verifier learned about the peer during one handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerVerification {
    pub pkix: VerifyOutcome,
    pub dane: DaneOutcome,
}

/// Records path validation and DANE results without failing the handshake.
///
/// Whether an unverified peer is acceptable is a policy decision taken
/// once the channel is up, so that a refusal can still be sent over it.
/// Handshake signatures are always checked.
#[derive(Debug)]
pub(super) struct PeerVerifier {
    pub(super) webpki: Option<Arc<WebPkiServerVerifier>>,
    pub(super) check_pkix: bool,
    pub(super) tlsa: Option<Vec<TlsaRecord>>,
    pub(super) provider: Arc<CryptoProvider>,
    pub(super) outcome: Arc<Mutex<PeerVerification>>,
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let pkix = match (&self.webpki, self.check_pkix) {
            (_, false) => VerifyOutcome::None,
            (None, true) => VerifyOutcome::Fail,
            (Some(webpki), true) => match webpki.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Ok(_) => VerifyOutcome::Ok,
                Err(err) => {
                    tracing::debug!(%err, "Peer certificate failed path validation");
                    VerifyOutcome::Fail
                }
            },
        };

        let dane = self.tlsa.as_deref().map_or(DaneOutcome::NotApplicable, |records| {
            let chain = intermediates.iter().map(AsRef::as_ref).collect::<Vec<_>>();
            dane::verify_chain(
                records,
                end_entity.as_ref(),
                &chain,
                pkix == VerifyOutcome::Ok,
            )
        });

        *self.outcome.lock() = PeerVerification { pkix, dane };

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(
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
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(
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
}
