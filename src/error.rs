use crate::resolver::Endpoint;
use std::{fmt, io, net::SocketAddr, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("could not resolve {endpoint}: {source}")]
    Lookup {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("{endpoint} did not resolve to any address")]
    NoAddresses { endpoint: Endpoint },
    #[error("unknown TCP service {service:?}")]
    UnknownService { service: String },
    #[error("invalid port {port:?}")]
    InvalidPort { port: String },
}

/// Why a single candidate address could not be connected to.
#[derive(Debug, Error)]
pub enum CandidateConnectError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),
    #[error("no response within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug)]
pub struct CandidateFailure {
    pub addr: SocketAddr,
    pub error: CandidateConnectError,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.addr, self.error)
    }
}

#[derive(Debug, Error)]
#[error("could not connect to any of {} candidate address(es)", .failures.len())]
pub struct ConnectionError {
    pub failures: Vec<CandidateFailure>,
}

#[derive(Debug, Error)]
pub enum EstablishError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
