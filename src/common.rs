use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::header::{CONNECTION, CONTENT_LENGTH, HeaderValue};
use hyper::{Response, StatusCode};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

/// Body type used on both legs of a forwarded exchange.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// Local responses the proxy generates itself.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Empty-bodied response closing the client connection.
    pub fn status(status: StatusCode) -> Response<ProxyBody> {
        let mut response = Response::new(empty());
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        response
    }

    pub fn from_error(error: &ProxyError) -> Response<ProxyBody> {
        Self::status(error.status_code())
    }
}

/// TLS configuration utilities
pub struct TlsConfig;

impl TlsConfig {
    /// Creates the listener TLS configuration from certificate and key files
    pub fn create_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, ProxyError> {
        let mut private_key_file = BufReader::new(
            File::open(private_key_path)
                .map_err(|e| ProxyError::Config(format!("Failed to open private key file: {}", e)))?,
        );

        let mut cert_file = BufReader::new(
            File::open(cert_path)
                .map_err(|e| ProxyError::Config(format!("Failed to open certificate file: {}", e)))?,
        );

        let certs = rustls_pemfile::certs(&mut cert_file)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(ProxyError::Config("No valid certificate found".to_string()));
        }

        let private_key = rustls_pemfile::private_key(&mut private_key_file)
            .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
            .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))
    }

    /// Client configuration for `https` origins, trusting the webpki roots.
    pub fn origin_client_config() -> Arc<ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Validates TLS files exist and are readable before starting server
    pub fn validate_tls_files(private_key_path: &str, cert_path: &str) -> Result<(), ProxyError> {
        File::open(private_key_path)
            .map_err(|e| ProxyError::Config(format!("Private key file not accessible: {}", e)))?;

        File::open(cert_path)
            .map_err(|e| ProxyError::Config(format!("Certificate file not accessible: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_responses_are_empty_and_close() {
        let response = ResponseBuilder::status(StatusCode::BAD_GATEWAY);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[CONTENT_LENGTH], "0");
        assert_eq!(response.headers()[CONNECTION], "close");

        let response = ResponseBuilder::from_error(&ProxyError::Forbidden("x".to_string()));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_missing_tls_files_are_config_errors() {
        let err = TlsConfig::create_config("/nonexistent/key.pem", "/nonexistent/cert.pem").unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        assert!(TlsConfig::validate_tls_files("/nonexistent/key.pem", "/nonexistent/cert.pem").is_err());
    }

    #[tokio::test]
    async fn test_full_body_collects() {
        let body = full("hello");
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello"));
    }
}
