//! Client TLS material from the command line

use std::path::Path;

use crate::common::{Error, Result};
use crate::sdk::TlsConfig;

/// Load the client certificate and key; both or neither must be given
pub fn load(cert_path: Option<&Path>, key_path: Option<&Path>) -> Result<Option<TlsConfig>> {
    match (cert_path, key_path) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => Ok(Some(TlsConfig {
            client_cert: read(cert, "client certificate")?,
            client_key: read(key, "client key")?,
        })),
        _ => Err(Error::Config(
            "client cert path and key path must both be set or both be unset".to_string(),
        )),
    }
}

fn read(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::Config(format!("Failed to read {} {}: {}", what, path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neither_is_no_tls() {
        assert!(load(None, None).unwrap().is_none());
    }

    #[test]
    fn test_only_one_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = tmp.path().join("client.pem");
        std::fs::write(&cert, "cert").unwrap();

        let err = load(Some(&cert), None).unwrap_err();
        assert!(err.to_string().contains("both"));
        assert!(load(None, Some(&cert)).is_err());
    }

    #[test]
    fn test_both_are_read() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = tmp.path().join("client.pem");
        let key = tmp.path().join("client.key");
        std::fs::write(&cert, "cert").unwrap();
        std::fs::write(&key, "key").unwrap();

        let tls = load(Some(&cert), Some(&key)).unwrap().unwrap();
        assert_eq!(tls.client_cert, b"cert");
        assert_eq!(tls.client_key, b"key");
    }

    #[test]
    fn test_missing_file_names_path() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = tmp.path().join("absent.pem");
        let err = load(Some(&cert), Some(&cert)).unwrap_err();
        assert!(err.to_string().contains("absent.pem"));
    }
}
