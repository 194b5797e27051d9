//! Connection establishment tests against loopback listeners.

use std::{net::SocketAddr, time::Duration};

use netbear::{
    connector::{self, ConnectOptions, Connector},
    error::{CandidateConnectError, EstablishError, ResolutionError},
    relay::{RelayOptions, RelayOutcome, StreamRelay},
    resolver::{self, Endpoint},
};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    time,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// An address nothing listens on: bind an ephemeral port, then release it.
async fn refused() -> SocketAddr {
    let (listener, addr) = listen().await;
    drop(listener);
    addr
}

/// A listener whose accept queue is full, so further connection attempts get no answer.
///
/// Linux drops SYNs for a listener with a full accept queue; the returned streams keep it full.
#[cfg(target_os = "linux")]
async fn unanswered() -> (TcpListener, SocketAddr, Vec<TcpStream>) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut queued = Vec::new();
    loop {
        let attempt = time::timeout(Duration::from_millis(200), TcpStream::connect(addr));
        let Ok(stream) = attempt.await else { break };
        queued.push(stream.expect("connect while the accept queue has room"));
        assert!(queued.len() < 64, "accept queue never filled up");
    }

    (listener, addr, queued)
}

fn with_timeout(secs: u64) -> ConnectOptions {
    ConnectOptions {
        timeout: Some(Duration::from_secs(secs)),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn falls_back_to_the_first_live_candidate() {
    let (listener, live) = listen().await;
    let candidates = [refused().await, refused().await, live];

    let connection = Connector::new(with_timeout(5))
        .connect(&candidates)
        .await
        .expect("last candidate accepts");

    assert_eq!(connection.peer, live);
    assert_eq!(connection.stream.peer_addr().unwrap(), live);
    assert_eq!(connection.failures.len(), 2);
    for (failure, addr) in connection.failures.iter().zip(&candidates) {
        assert_eq!(failure.addr, *addr);
        assert!(matches!(failure.error, CandidateConnectError::Connect(_)));
    }

    let (_, client) = listener.accept().await.unwrap();
    assert_eq!(client, connection.stream.local_addr().unwrap());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn unanswered_candidate_times_out_and_the_next_is_tried() {
    let (_silent, silent_addr, _queued) = unanswered().await;
    let (listener, live) = listen().await;
    let limit = Duration::from_millis(300);

    let connection = Connector::new(ConnectOptions {
        timeout: Some(limit),
        ..Default::default()
    })
    .connect(&[silent_addr, live])
    .await
    .expect("second candidate accepts");

    assert_eq!(connection.peer, live);
    assert_eq!(connection.failures.len(), 1);
    assert_eq!(connection.failures[0].addr, silent_addr);
    assert!(matches!(
        connection.failures[0].error,
        CandidateConnectError::TimedOut(waited) if waited == limit
    ));

    listener.accept().await.unwrap();
}

#[tokio::test]
async fn stops_at_the_first_success() {
    let (first, first_addr) = listen().await;
    let (_second, second_addr) = listen().await;

    let connection = Connector::new(ConnectOptions::default())
        .connect(&[first_addr, second_addr])
        .await
        .unwrap();

    assert_eq!(connection.peer, first_addr);
    assert!(connection.failures.is_empty());
    first.accept().await.unwrap();
}

#[tokio::test]
async fn exhausted_candidates_are_a_connection_error() {
    let candidates = [refused().await, refused().await];

    let err = Connector::new(with_timeout(5))
        .connect(&candidates)
        .await
        .expect_err("nothing is listening");

    assert_eq!(err.failures.len(), 2);
    assert_eq!(err.failures[0].addr, candidates[0]);
    assert_eq!(err.failures[1].addr, candidates[1]);
}

#[tokio::test]
async fn no_candidates_is_a_connection_error() {
    let err = Connector::new(ConnectOptions::default())
        .connect(&[])
        .await
        .expect_err("nothing to try");

    assert!(err.failures.is_empty());
}

#[tokio::test]
async fn resolves_numeric_host_and_port() {
    let candidates = resolver::resolve(&Endpoint::new("127.0.0.1", "4242"))
        .await
        .unwrap();

    assert_eq!(candidates, vec!["127.0.0.1:4242".parse().unwrap()]);
}

#[tokio::test]
async fn unresolvable_host_is_a_resolution_error() {
    let err = resolver::resolve(&Endpoint::new("host.invalid", "80"))
        .await
        .expect_err(".invalid never resolves");

    assert!(matches!(
        err,
        ResolutionError::Lookup { .. } | ResolutionError::NoAddresses { .. }
    ));
}

#[tokio::test]
async fn establish_reports_resolution_failures() {
    let endpoint = Endpoint::new("127.0.0.1", "not-a-real-service");

    let err = connector::establish(&endpoint, &ConnectOptions::default())
        .await
        .expect_err("unknown service");

    assert!(matches!(
        err,
        EstablishError::Resolution(ResolutionError::UnknownService { .. })
    ));
}

#[tokio::test]
async fn retry_gives_up_immediately_on_permanent_errors() {
    let endpoint = Endpoint::new("127.0.0.1", "not-a-real-service");

    let result = time::timeout(
        Duration::from_secs(5),
        connector::establish_with_retry(
            &endpoint,
            &ConnectOptions::default(),
            Duration::from_secs(60),
        ),
    )
    .await
    .expect("permanent errors are not retried");

    assert!(matches!(result, Err(EstablishError::Resolution(_))));
}

#[tokio::test]
async fn retry_gives_up_when_the_budget_is_spent() {
    let addr = refused().await;
    let endpoint = Endpoint::new("127.0.0.1", addr.port().to_string());

    let result = time::timeout(
        Duration::from_secs(30),
        connector::establish_with_retry(&endpoint, &with_timeout(1), Duration::from_secs(2)),
    )
    .await
    .expect("retry budget bounds the wait");

    assert!(matches!(result, Err(EstablishError::Connection(_))));
}

/// Two candidates, the first refuses; "ping" goes out, "pong" comes back, both sides drain.
#[tokio::test]
async fn ping_pong_through_the_fallback_candidate() {
    let (listener, live) = listen().await;
    let server = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        conn.read_to_end(&mut request).await.unwrap();
        conn.write_all(b"pong").await.unwrap();
        request
    });

    let connection = Connector::new(with_timeout(5))
        .connect(&[refused().await, live])
        .await
        .unwrap();
    assert_eq!(connection.peer, live);
    assert_eq!(connection.failures.len(), 1);

    let (mut stdin, relay_stdin) = duplex(64);
    let (mut stdout, relay_stdout) = duplex(64);
    let (socket_reader, socket_writer) = connection.stream.into_split();
    let relay = tokio::spawn(
        StreamRelay::new(
            relay_stdin,
            relay_stdout,
            socket_reader,
            socket_writer,
            RelayOptions {
                idle_timeout: Some(Duration::from_secs(10)),
                ..Default::default()
            },
        )
        .run(),
    );

    stdin.write_all(b"ping").await.unwrap();
    drop(stdin);

    let mut response = Vec::new();
    stdout.read_to_end(&mut response).await.unwrap();

    assert_eq!(response, b"pong");
    assert_eq!(server.await.unwrap(), b"ping");

    let report = relay.await.unwrap();
    assert_eq!(report.outcome, RelayOutcome::Drained);
    assert_eq!(report.bytes_sent, 4);
    assert_eq!(report.bytes_received, 4);
}
