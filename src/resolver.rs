use crate::error::ResolutionError;
use std::{fmt, fs, net::SocketAddr};
use tokio::net;

const SERVICES_DATABASE: &str = "/etc/services";

/// Destination given on the command line, before name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolves the endpoint into candidate addresses, in the order the system resolver returned them.
pub async fn resolve(endpoint: &Endpoint) -> Result<Vec<SocketAddr>, ResolutionError> {
    let port = resolve_port(&endpoint.port)?;

    let candidates = net::lookup_host((endpoint.host.as_str(), port))
        .await
        .map_err(|source| ResolutionError::Lookup {
            endpoint: endpoint.clone(),
            source,
        })?
        .collect::<Vec<_>>();

    if candidates.is_empty() {
        return Err(ResolutionError::NoAddresses {
            endpoint: endpoint.clone(),
        });
    }

    log::debug!(
        "{} resolved to {} candidate address(es): {:?}",
        endpoint,
        candidates.len(),
        candidates
    );

    Ok(candidates)
}

/// Accepts a numeric port or a TCP service name from the services database.
///
/// Service names are read straight from `/etc/services`, not through NSS as `getaddrinfo`
/// would do, so services provided only by other NSS backends are not found.
pub fn resolve_port(port: &str) -> Result<u16, ResolutionError> {
    let invalid = || ResolutionError::InvalidPort {
        port: port.to_owned(),
    };

    if port.is_empty() {
        return Err(invalid());
    }

    if port.bytes().all(|b| b.is_ascii_digit()) {
        return port.parse().map_err(|_| invalid());
    }

    let services = match fs::read_to_string(SERVICES_DATABASE) {
        Ok(services) => services,
        Err(e) => {
            log::debug!("failed to read {}: {}", SERVICES_DATABASE, e);
            String::new()
        }
    };

    lookup_service(&services, port).ok_or_else(|| ResolutionError::UnknownService {
        service: port.to_owned(),
    })
}

fn lookup_service(services: &str, service: &str) -> Option<u16> {
    services.lines().find_map(|line| {
        let entry = line.split('#').next()?;
        let mut fields = entry.split_whitespace();
        let name = fields.next()?;
        let (port, protocol) = fields.next()?.split_once('/')?;
        if protocol != "tcp" {
            return None;
        }

        if name == service || fields.any(|alias| alias == service) {
            port.parse().ok()
        } else {
            None
        }
    })
}
