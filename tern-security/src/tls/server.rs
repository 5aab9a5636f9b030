use std::{fs::File, io::BufReader, path::Path, sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};

use super::TlsInfo;
use crate::error::{TlsError, TlsResult};

fn load_certs(path: &Path) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
}

fn load_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let path_str = path.display().to_string();
    let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })?);

    match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
        path: path_str.clone(),
        reason: e.to_string(),
    })? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => Err(TlsError::KeyLoad {
            path: path_str,
            reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                .to_string(),
        }),
    }
}

/// Server side TLS state, loaded once per listener
#[derive(Clone)]
pub struct ServerTlsContext {
    acceptor: TlsAcceptor,
}

impl core::fmt::Debug for ServerTlsContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerTlsContext").finish_non_exhaustive()
    }
}

impl ServerTlsContext {
    ///
    /// Loads the certificate chain and private key used for `STARTTLS`
    ///
    /// # Errors
    /// If either file cannot be read or parsed, or rustls refuses the pair
    ///
    #[tracing::instrument(level = "debug", fields(certificate = %certificate.display()), skip_all)]
    pub fn load(certificate: &Path, key: &Path) -> TlsResult<Self> {
        let certs = load_certs(certificate).map_err(|e| TlsError::CertificateLoad {
            path: certificate.display().to_string(),
            source: e,
        })?;
        if certs.is_empty() {
            return Err(TlsError::CertificateLoad {
                path: certificate.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "no certificates found",
                ),
            });
        }

        let key = load_key(key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    ///
    /// Performs the server side of the handshake after `220 Ready to start TLS`
    ///
    /// # Errors
    /// On timeout or handshake failure; the stream is consumed either way
    ///
    pub async fn accept<S>(&self, stream: S, timeout: Duration) -> TlsResult<(TlsStream<S>, TlsInfo)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tracing::debug!("Upgrading connection ...");

        let stream = tokio::time::timeout(timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| TlsError::Timeout(timeout.as_secs()))?
            .map_err(|e| TlsError::Handshake(e.to_string()))?;

        let (_, connection) = stream.get_ref();
        let info = TlsInfo::of(
            connection.protocol_version(),
            connection.negotiated_cipher_suite(),
        );

        Ok((stream, info))
    }
}
