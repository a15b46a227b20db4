use std::{fs::File, io::BufReader, path::Path, sync::Arc, time::SystemTime};

use rustls::{
    client::{ClientConfig, ServerCertVerified, ServerCertVerifier, ServerName},
    Certificate,
    OwnedTrustAnchor,
    PrivateKey,
    RootCertStore,
};
use rustls_pemfile::Item;
use tokio_rustls::TlsConnector;

use crate::{
    client::options::TlsOptions,
    error::{Error, ErrorKind, Result},
    runtime::BaseStream,
};

/// Configuration required to use TLS. Creating this is expensive, so it is
/// built once per client and shared by every connection.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str("TlsConfig")
    }
}

impl TlsConfig {
    pub(crate) fn new(options: &TlsOptions) -> Result<TlsConfig> {
        let config = build_client_config(options)?;
        Ok(TlsConfig {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Begins a TLS handshake over `base`, returning the in-flight
    /// negotiation. The async scanner polls this directly; everyone else
    /// awaits it via [`TlsConfig::wrap`].
    pub(crate) fn start(
        &self,
        host: &str,
        base: BaseStream,
    ) -> Result<tokio_rustls::Connect<BaseStream>> {
        let name = ServerName::try_from(host).map_err(|e| ErrorKind::DnsResolve {
            message: format!("could not resolve {:?}: {}", host, e),
        })?;
        Ok(self.connector.connect(name, base))
    }

    pub(crate) async fn wrap(
        &self,
        host: &str,
        base: BaseStream,
    ) -> Result<tokio_rustls::client::TlsStream<BaseStream>> {
        Ok(self.start(host, base)?.await?)
    }
}

fn build_client_config(options: &TlsOptions) -> Result<ClientConfig> {
    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(trust_roots(options)?);

    let mut config = match options.cert_key_file_path {
        Some(ref path) => {
            let (chain, key) = read_identity(path)?;
            builder.with_single_cert(chain, key).map_err(|e| {
                tls_error(format!(
                    "client identity in {} was rejected: {}",
                    path.display(),
                    e
                ))
            })?
        }
        None => builder.with_no_client_auth(),
    };
    config.enable_sni = true;

    if options.allow_invalid_certificates == Some(true) {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(SkipVerification));
    }

    Ok(config)
}

/// The certificates servers are verified against: the configured CA file, or
/// the bundled web trust anchors when none is given.
fn trust_roots(options: &TlsOptions) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    let path = match options.ca_file_path {
        Some(ref path) => path,
        None => {
            let anchors = webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|anchor| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(
                    anchor.subject,
                    anchor.spki,
                    anchor.name_constraints,
                )
            });
            roots.add_server_trust_anchors(anchors);
            return Ok(roots);
        }
    };

    for item in pem_items(path)? {
        if let Item::X509Certificate(der) = item {
            roots.add(&Certificate(der)).map_err(|e| {
                tls_error(format!(
                    "root certificate in {} was rejected: {}",
                    path.display(),
                    e
                ))
            })?;
        }
    }
    if roots.is_empty() {
        return Err(tls_error(format!(
            "{} holds no certificates",
            path.display()
        )));
    }

    Ok(roots)
}

/// The client certificate chain and private key from one PEM file.
fn read_identity(path: &Path) -> Result<(Vec<Certificate>, PrivateKey)> {
    let mut chain = Vec::new();
    let mut key = None;

    for item in pem_items(path)? {
        match item {
            Item::X509Certificate(der) => chain.push(Certificate(der)),
            Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => {
                key.get_or_insert(PrivateKey(der));
            }
            _ => {}
        }
    }

    match (chain.is_empty(), key) {
        (false, Some(key)) => Ok((chain, key)),
        (true, _) => Err(tls_error(format!(
            "{} holds no client certificate",
            path.display()
        ))),
        (false, None) => Err(tls_error(format!(
            "{} holds no private key",
            path.display()
        ))),
    }
}

fn pem_items(path: &Path) -> Result<Vec<Item>> {
    let file = File::open(path)
        .map_err(|e| tls_error(format!("could not open {}: {}", path.display(), e)))?;
    rustls_pemfile::read_all(&mut BufReader::new(file))
        .map_err(|_| tls_error(format!("{} is not valid PEM", path.display())))
}

fn tls_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidTlsConfig {
        message: message.into(),
    })
}

/// Accepts any server certificate. Installed only when certificate
/// validation has been explicitly disabled.
struct SkipVerification;

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
