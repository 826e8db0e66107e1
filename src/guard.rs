//! Host header gate for the dashboard route

use hyper::Request;

/// Admits requests addressed to the configured public domain
#[derive(Debug, Clone)]
pub struct AccessGuard {
    domain: String,
}

impl AccessGuard {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.trim().to_ascii_lowercase(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Check the request's Host header (or HTTP/2 authority)
    pub fn admits<B>(&self, req: &Request<B>) -> bool {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()));

        match host {
            Some(host) => host_matches(host, &self.domain),
            None => false,
        }
    }
}

/// Compare a Host value with the domain, case-insensitively. When the domain
/// carries no port, any port on the Host value is ignored.
pub fn host_matches(host: &str, domain: &str) -> bool {
    let host = host.trim();
    let host = if has_port(domain) {
        host
    } else {
        strip_port(host)
    };
    host.eq_ignore_ascii_case(domain)
}

/// Split `authority` into host and optional port. Bracketed IPv6 literals
/// keep their brackets.
fn split_port(authority: &str) -> (&str, Option<&str>) {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => {
                let port = authority[end + 1..].strip_prefix(':');
                (&authority[..=end], port)
            }
            None => (authority, None),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    }
}

fn has_port(authority: &str) -> bool {
    split_port(authority).1.is_some()
}

fn strip_port(authority: &str) -> &str {
    split_port(authority).0
}
