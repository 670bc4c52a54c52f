use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsErr {
    #[error("dns name")]
    Dns,
    #[error("handshake timed out")]
    Timeout,
    #[error("{0}")]
    Rustls(String),
}

impl From<rustls::Error> for TlsErr {
    fn from(err: rustls::Error) -> Self {
        TlsErr::Rustls(err.to_string())
    }
}

/// Client configuration trusting the webpki root set, using the `ring` provider.
pub fn default_config() -> Result<Arc<ClientConfig>, TlsErr> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cfg = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(cfg))
}

pub fn client_connection(config: &Arc<ClientConfig>, host: &str) -> Result<ClientConnection, TlsErr> {
    let dns = ServerName::try_from(host.to_owned()).map_err(|_| TlsErr::Dns)?;
    Ok(ClientConnection::new(Arc::clone(config), dns)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_default_config() {
        assert!(default_config().is_ok());
    }

    #[test]
    fn rejects_invalid_server_names() {
        let cfg = default_config().unwrap();
        assert_eq!(
            client_connection(&cfg, "not a host").err(),
            Some(TlsErr::Dns)
        );
        assert!(client_connection(&cfg, "example.com").is_ok());
        assert!(client_connection(&cfg, "127.0.0.1").is_ok());
    }
}
