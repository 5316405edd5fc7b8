//! Listener address validation

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::ListenerConfig;
use std::net::SocketAddr;

/// Validate that listener addresses parse as socket addresses
pub fn validate_addresses(listener: &ListenerConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    if listener.address.parse::<SocketAddr>().is_err() {
        result.add_error(ValidationError::new(
            ErrorCategory::Listener,
            format!(
                "Invalid listener address '{}', expected e.g. \"0.0.0.0:443\"",
                listener.address
            ),
        ));
    }

    if let Some(ref http) = listener.http_address {
        match http.parse::<SocketAddr>() {
            Ok(addr) => {
                if listener.address.parse::<SocketAddr>().ok() == Some(addr) {
                    result.add_error(ValidationError::new(
                        ErrorCategory::Listener,
                        format!("http-address '{}' is the same as the TLS address", http),
                    ));
                }
            }
            Err(_) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Listener,
                    format!("Invalid http-address '{}', expected e.g. \"0.0.0.0:80\"", http),
                ));
            }
        }
    }

    for protocol in &listener.alpn {
        if protocol.is_empty() || protocol.len() > 255 {
            result.add_error(ValidationError::new(
                ErrorCategory::Listener,
                format!("ALPN protocol '{}' must be 1 to 255 bytes", protocol),
            ));
        }
        if protocol == "acme-tls/1" {
            result.add_error(ValidationError::new(
                ErrorCategory::Listener,
                "acme-tls/1 is reserved for tls-alpn-01 validation",
            ));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        let listener = ListenerConfig {
            address: "127.0.0.1:8443".to_string(),
            http_address: Some("[::1]:8080".to_string()),
            ..Default::default()
        };
        assert!(validate_addresses(&listener).is_ok());
    }

    #[test]
    fn test_invalid_addresses() {
        let listener = ListenerConfig {
            address: "localhost".to_string(),
            http_address: Some("nowhere".to_string()),
            ..Default::default()
        };
        assert_eq!(validate_addresses(&listener).errors.len(), 2);
    }

    #[test]
    fn test_reserved_alpn_rejected() {
        let listener = ListenerConfig {
            alpn: vec!["acme-tls/1".to_string()],
            ..Default::default()
        };
        assert!(!validate_addresses(&listener).is_ok());
    }
}
