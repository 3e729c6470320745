use crate::error::ProxyError;
use hyper::header::{HOST, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{HeaderMap, Method, Request, Uri, Version};
use std::fmt;
use std::str::FromStr;

const MAX_HEADERS: usize = 100;

/// Request line and header section of a request, as read off the wire.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// Length in bytes of the request line plus header section.
    pub header_len: usize,
}

impl RequestHead {
    /// Parses a complete request head from `buf`, or `None` if more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let header_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(ProxyError::MalformedRequest(format!("Invalid request head: {}", e))),
        };

        let method = req
            .method
            .ok_or_else(|| ProxyError::MalformedRequest("Missing method".to_string()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| ProxyError::MalformedRequest(format!("Invalid method: {}", e)))?;
        let target = req
            .path
            .ok_or_else(|| ProxyError::MalformedRequest("Missing request target".to_string()))?
            .to_string();
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut header_map = HeaderMap::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            let name = hyper::header::HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| ProxyError::MalformedRequest(format!("Invalid header name: {}", e)))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| ProxyError::MalformedRequest(format!("Invalid header value: {}", e)))?;
            header_map.append(name, value);
        }

        Ok(Some(Self {
            method,
            target,
            version,
            headers: header_map,
            header_len,
        }))
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }
}

/// `host:port` target of a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Parses an authority-form target. The port is mandatory and must be 1-65535.
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        if target.contains('@') || target.contains('/') {
            return Err(ProxyError::MalformedRequest(format!(
                "CONNECT target must be host:port, got '{}'",
                target
            )));
        }
        let authority = Authority::from_str(target).map_err(|e| {
            ProxyError::MalformedRequest(format!("Invalid CONNECT target '{}': {}", target, e))
        })?;
        Self::from_authority(&authority)
    }

    pub fn from_authority(authority: &Authority) -> Result<Self, ProxyError> {
        let host = authority.host();
        if host.is_empty() || host == "[]" {
            return Err(ProxyError::MalformedRequest(format!(
                "CONNECT target '{}' has no host",
                authority
            )));
        }
        let port = match authority.port_u16() {
            Some(0) | None => {
                return Err(ProxyError::MalformedRequest(format!(
                    "CONNECT target '{}' needs a port in 1-65535",
                    authority
                )));
            }
            Some(port) => port,
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Host as passed to the resolver, without IPv6 brackets.
    pub fn resolver_host(&self) -> &str {
        strip_brackets(&self.host)
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ConnectTarget {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OriginScheme {
    Http,
    Https,
}

impl OriginScheme {
    pub fn default_port(self) -> u16 {
        match self {
            OriginScheme::Http => 80,
            OriginScheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OriginScheme::Http => "http",
            OriginScheme::Https => "https",
        }
    }
}

/// Connection key for an origin server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: OriginScheme,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn resolver_host(&self) -> &str {
        strip_brackets(&self.host)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// An absolute-form proxy request and its origin-relative rewrite.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub version: Version,
    pub original_target: String,
    pub origin: Origin,
    /// `host[:port]` exactly as given in the request target.
    pub authority: String,
    /// `path[?query]`, `/` when the target had no path.
    pub origin_form: PathAndQuery,
}

impl ForwardRequest {
    /// Derives the forwarding parameters from an absolute-form request target.
    pub fn from_parts(method: &Method, uri: &Uri, version: Version) -> Result<Self, ProxyError> {
        let (scheme, authority) = match (uri.scheme(), uri.authority()) {
            (Some(scheme), Some(authority)) => (scheme, authority),
            _ => {
                return Err(ProxyError::MalformedRequest(format!(
                    "Request target '{}' is not in absolute form",
                    uri
                )));
            }
        };

        let scheme = if *scheme == Scheme::HTTP {
            OriginScheme::Http
        } else if *scheme == Scheme::HTTPS {
            OriginScheme::Https
        } else {
            return Err(ProxyError::MalformedRequest(format!(
                "Unsupported scheme '{}' in request target",
                scheme
            )));
        };

        let host = authority.host();
        if host.is_empty() {
            return Err(ProxyError::MalformedRequest(format!(
                "Request target '{}' has no host",
                uri
            )));
        }
        let port = match authority.port() {
            Some(port) => match port.as_u16() {
                0 => {
                    return Err(ProxyError::MalformedRequest(format!(
                        "Request target '{}' has port 0",
                        uri
                    )));
                }
                value => value,
            },
            None => scheme.default_port(),
        };
        // Userinfo never reaches the Host header.
        let host_header = match authority.port() {
            Some(port) => format!("{}:{}", host, port.as_str()),
            None => host.to_string(),
        };

        let origin_form = match uri.path_and_query() {
            Some(pq) if pq.as_str().starts_with('/') => pq.clone(),
            Some(pq) => PathAndQuery::from_str(&format!("/{}", pq.as_str()))
                .map_err(|e| ProxyError::MalformedRequest(format!("Invalid path: {}", e)))?,
            None => PathAndQuery::from_static("/"),
        };

        Ok(Self {
            method: method.clone(),
            version,
            original_target: uri.to_string(),
            origin: Origin {
                scheme,
                host: host.to_string(),
                port,
            },
            authority: host_header,
            origin_form,
        })
    }

    /// `METHOD path[?query] HTTP/version` as sent to the origin.
    pub fn request_line(&self) -> String {
        let version = match self.version {
            Version::HTTP_10 => "HTTP/1.0",
            _ => "HTTP/1.1",
        };
        format!("{} {} {}", self.method, self.origin_form, version)
    }

    /// Rewrites `req` to origin-relative form and overwrites its Host header.
    /// Every other header and the body are left untouched.
    pub fn rewrite<B>(&self, req: &mut Request<B>) -> Result<(), ProxyError> {
        let uri = Uri::from_str(self.origin_form.as_str())
            .map_err(|e| ProxyError::MalformedRequest(format!("Invalid origin-form target: {}", e)))?;
        *req.uri_mut() = uri;

        let host = HeaderValue::from_str(&self.authority)
            .map_err(|e| ProxyError::MalformedRequest(format!("Invalid Host value: {}", e)))?;
        req.headers_mut().insert(HOST, host);
        Ok(())
    }
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
