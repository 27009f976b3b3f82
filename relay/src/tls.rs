//! TLS to guacd
//!
//! guacd can be started with `-C`/`-K` to require TLS. The relay verifies
//! its certificate against a configured CA bundle, or the webpki roots when
//! none is given.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use guactunnel_shared::{Error, Result, Status};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Build the connector used for every guacd connection.
pub fn connector(ca_file: Option<&Path>) -> anyhow::Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .with_context(|| format!("Invalid CA certificate in {}", path.display()))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Load a PEM certificate bundle
fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut file = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open CA file: {}", path.display()))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse PEM certificates")?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in {}", path.display()));
    }
    info!("Loaded {} CA certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Run the TLS handshake over an established guacd connection.
pub async fn handshake(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
        Error::Server(format!("Invalid TLS server name '{}': {}", host, e))
    })?;
    let stream = connector.connect(server_name, tcp).await.map_err(|e| {
        Status::UpstreamError.to_error(format!("TLS handshake with guacd failed: {}", e))
    })?;
    debug!("TLS connection to guacd established (server_name={})", host);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roots() {
        assert!(connector(None).is_ok());
    }

    #[test]
    fn test_missing_or_empty_ca_file() {
        assert!(connector(Some(Path::new("/nonexistent/ca.pem"))).is_err());

        let path = std::env::temp_dir().join(format!("guactunnel-empty-{}.pem", std::process::id()));
        std::fs::write(&path, "not a certificate\n").unwrap();
        match connector(Some(&path)) {
            Ok(_) => panic!("accepted a CA file without certificates"),
            Err(err) => assert!(err.to_string().contains("No certificates")),
        }
        std::fs::remove_file(&path).unwrap();
    }
}
