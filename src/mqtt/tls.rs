//! TLS transport for the broker connection

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rumqttc::{TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::config::TlsConfig;
use crate::error::MqttError;

fn tls_error(context: &str, e: impl std::fmt::Display) -> MqttError {
    MqttError::ConnectionFailed(format!("{}: {}", context, e))
}

/// Build a rustls transport from the TLS settings
pub fn build_transport(config: &TlsConfig) -> Result<Transport, MqttError> {
    let roots = root_store(config)?;
    let builder = ClientConfig::builder().with_root_certificates(roots);

    let mut tls = match (&config.cert_file, &config.key_file) {
        (Some(cert_file), Some(key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)
            .map_err(|e| tls_error("failed to set client cert", e))?,
        _ => builder.with_no_client_auth(),
    };

    if config.insecure {
        warn!("TLS certificate validation disabled (insecure mode)");
        tls.dangerous()
            .set_certificate_verifier(Arc::new(InsecureServerCertVerifier));
    }

    Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
        Arc::new(tls),
    )))
}

/// Trust anchors: CA file, else every PEM in the CA directory, else webpki roots
fn root_store(config: &TlsConfig) -> Result<RootCertStore, MqttError> {
    let mut store = RootCertStore::empty();

    if let Some(ca_file) = &config.ca_file {
        for cert in load_certs(ca_file)? {
            store
                .add(cert)
                .map_err(|e| tls_error("failed to add CA cert", e))?;
        }
    } else if let Some(ca_path) = &config.ca_path {
        let entries =
            std::fs::read_dir(ca_path).map_err(|e| tls_error("failed to read CA path", e))?;
        for path in entries.flatten().map(|entry| entry.path()) {
            if !path.extension().is_some_and(|ext| ext == "crt" || ext == "pem") {
                continue;
            }
            match load_certs(&path) {
                Ok(certs) => {
                    let (added, ignored) = store.add_parsable_certificates(certs);
                    debug!("{}: {} CA certs added, {} ignored", path.display(), added, ignored);
                }
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
    } else {
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    Ok(store)
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, MqttError> {
    let file = File::open(path).map_err(|e| tls_error("failed to open cert file", e))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error("failed to parse certs", e))
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, MqttError> {
    let file = File::open(path).map_err(|e| tls_error("failed to open key file", e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_error("failed to parse private key", e))?
        .ok_or_else(|| {
            MqttError::ConnectionFailed(format!("no private key found in {}", path.display()))
        })
}

/// Accepts any server certificate; only enabled by MQTT_TLS_INSECURE
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        use SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}
