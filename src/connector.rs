use crate::{
    error::{
        CandidateConnectError, CandidateFailure, ConnectionError, EstablishError, ResolutionError,
    },
    resolver::{self, Endpoint},
};
use backoff::{future, ExponentialBackoffBuilder};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    net::{TcpSocket, TcpStream},
    time,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub keepalive: bool,
    pub nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keepalive: false,
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Bound on each connection attempt. `None` waits for as long as the OS does.
    pub timeout: Option<Duration>,
    pub socket: SocketOptions,
}

/// A live TCP connection and the candidates that were tried and failed before it.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub failures: Vec<CandidateFailure>,
}

pub struct Connector {
    options: ConnectOptions,
}

impl Connector {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }

    /// Tries the candidates strictly in order and returns the first connection that succeeds.
    pub async fn connect(&self, candidates: &[SocketAddr]) -> Result<Connection, ConnectionError> {
        let mut failures = Vec::new();

        for &addr in candidates {
            log::info!("attempting to connect to {}", addr);

            match self.connect_candidate(addr).await {
                Ok(stream) => {
                    log::info!("connected to {}", addr);
                    return Ok(Connection {
                        stream,
                        peer: addr,
                        failures,
                    });
                }
                Err(error) => {
                    log::warn!("connection to {} failed: {}", addr, error);
                    failures.push(CandidateFailure { addr, error });
                }
            }
        }

        Err(ConnectionError { failures })
    }

    async fn connect_candidate(&self, addr: SocketAddr) -> Result<TcpStream, CandidateConnectError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(CandidateConnectError::Socket)?;

        self.set_common_sockopts(&socket, addr);

        let attempt = socket.connect(addr);
        let stream = match self.options.timeout {
            Some(limit) => time::timeout(limit, attempt)
                .await
                .map_err(|_| CandidateConnectError::TimedOut(limit))?,
            None => attempt.await,
        }
        .map_err(CandidateConnectError::Connect)?;

        if let Err(e) = stream.set_nodelay(self.options.socket.nodelay) {
            log::warn!("failed to set TCP_NODELAY on connection to {}: {}", addr, e);
        }

        Ok(stream)
    }

    fn set_common_sockopts(&self, socket: &TcpSocket, addr: SocketAddr) {
        if self.options.socket.keepalive {
            if let Err(e) = socket.set_keepalive(true) {
                log::warn!("failed to set SO_KEEPALIVE for {}: {}", addr, e);
            }
        }
    }
}

/// Resolves the endpoint and connects to the first reachable candidate.
pub async fn establish(
    endpoint: &Endpoint,
    options: &ConnectOptions,
) -> Result<Connection, EstablishError> {
    log::info!("attempting to communicate with {}", endpoint);

    let candidates = resolver::resolve(endpoint).await?;
    let connection = Connector::new(options.clone())
        .connect(&candidates)
        .await?;

    Ok(connection)
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Repeats [`establish`] with exponential backoff until it succeeds or `budget` elapses.
pub async fn establish_with_retry(
    endpoint: &Endpoint,
    options: &ConnectOptions,
    budget: Duration,
) -> Result<Connection, EstablishError> {
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(INITIAL_BACKOFF)
        .with_max_interval(MAX_BACKOFF)
        .with_max_elapsed_time(Some(budget))
        .build();

    future::retry_notify(
        backoff,
        || async move {
            establish(endpoint, options).await.map_err(|e| match e {
                EstablishError::Resolution(
                    ResolutionError::InvalidPort { .. } | ResolutionError::UnknownService { .. },
                ) => backoff::Error::permanent(e),
                e => backoff::Error::transient(e),
            })
        },
        |err, wait| {
            log::warn!(
                "failed to establish a connection to {}: {}, retrying in {:?}",
                endpoint,
                err,
                wait
            );
        },
    )
    .await
}
