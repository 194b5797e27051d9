use crate::buffer::{DirectionalBuffer, BUFFER_CAPACITY};
use std::{fmt, future::Future, io, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Open,
    /// End of stream was seen on a source, or a sink was shut down after its direction drained.
    HalfClosed,
    /// Unusable; never polled again.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// stdin to socket.
    Upstream,
    /// Socket to stdout.
    Downstream,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Upstream => f.write_str("stdin -> socket"),
            Flow::Downstream => f.write_str("socket -> stdout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Both directions reached end of stream and every buffered byte was delivered.
    Drained,
    /// Nothing happened on any endpoint for longer than the idle timeout.
    IdleTimeout,
    /// The sink of the given direction broke; whatever was pending elsewhere was abandoned.
    SinkFailed(Flow),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    /// Bytes the socket write side accepted.
    pub bytes_sent: u64,
    /// Bytes stdout accepted. Only known to have arrived when the outcome is not `SinkFailed`.
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    pub idle_timeout: Option<Duration>,
    pub buffer_capacity: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            buffer_capacity: BUFFER_CAPACITY,
        }
    }
}

enum Event {
    Read(Flow, io::Result<usize>),
    Wrote(Flow, io::Result<usize>),
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

struct Direction<R, W> {
    flow: Flow,
    source: R,
    sink: W,
    source_state: EndpointState,
    sink_state: EndpointState,
    buffer: DirectionalBuffer,
    relayed: u64,
}

impl<R, W> Direction<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn new(flow: Flow, source: R, sink: W, capacity: usize) -> Self {
        Self {
            flow,
            source,
            sink,
            source_state: EndpointState::Open,
            sink_state: EndpointState::Open,
            buffer: DirectionalBuffer::new(capacity),
            relayed: 0,
        }
    }

    fn wants_read(&self) -> bool {
        self.source_state == EndpointState::Open && !self.buffer.is_full()
    }

    fn wants_write(&self) -> bool {
        self.sink_state == EndpointState::Open && !self.buffer.is_empty()
    }

    fn is_drained(&self) -> bool {
        self.source_state != EndpointState::Open && self.buffer.is_empty()
    }

    fn parts(&mut self) -> (&mut R, &mut W, &[u8], &mut [u8]) {
        let (pending, spare) = self.buffer.split();
        (&mut self.source, &mut self.sink, pending, spare)
    }

    fn on_read(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => {
                log::debug!("{}: source reached end of stream", self.flow);
                self.source_state = EndpointState::HalfClosed;
            }
            Ok(n) => {
                log::trace!("{}: read {} bytes", self.flow, n);
                self.buffer.produce(n);
            }
            Err(e) if is_retryable(&e) => {}
            Err(e) => {
                log::warn!("{}: read failed: {}", self.flow, e);
                self.source_state = EndpointState::Error;
            }
        }
    }

    fn on_write(&mut self, result: io::Result<usize>) {
        match result {
            Ok(0) => {
                log::warn!("{}: sink stopped accepting data", self.flow);
                self.sink_state = EndpointState::Error;
            }
            Ok(n) => {
                log::trace!("{}: wrote {} bytes", self.flow, n);
                self.buffer.consume(n);
                self.relayed += n as u64;
            }
            Err(e) if is_retryable(&e) => {}
            Err(e) => {
                log::warn!("{}: write failed: {}", self.flow, e);
                self.sink_state = EndpointState::Error;
            }
        }
    }

    /// Propagates end of stream to the sink once everything before it was delivered.
    async fn close_sink_if_drained(&mut self, limit: Option<Duration>) {
        if self.sink_state != EndpointState::Open || !self.is_drained() {
            return;
        }

        self.sink_state = match within(limit, self.sink.shutdown()).await {
            Some(Ok(())) => {
                log::debug!("{}: sink shut down", self.flow);
                EndpointState::HalfClosed
            }
            Some(Err(e)) => {
                log::warn!("{}: failed to shut down sink: {}", self.flow, e);
                EndpointState::Error
            }
            None => {
                log::warn!("{}: sink shutdown timed out", self.flow);
                EndpointState::Error
            }
        };
    }

    async fn flush_sink(&mut self, limit: Option<Duration>) {
        if self.sink_state != EndpointState::Open {
            return;
        }

        match within(limit, self.sink.flush()).await {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                log::warn!("{}: failed to flush sink: {}", self.flow, e);
                self.sink_state = EndpointState::Error;
            }
            None => {
                log::warn!("{}: sink flush timed out", self.flow);
                self.sink_state = EndpointState::Error;
            }
        }
    }
}

/// Moves bytes between a local stream pair and a socket until both directions are done.
pub struct StreamRelay<I, O, R, W> {
    upstream: Direction<I, W>,
    downstream: Direction<R, O>,
    idle_timeout: Option<Duration>,
}

impl<I, O, R, W> StreamRelay<I, O, R, W>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        stdin: I,
        stdout: O,
        socket_reader: R,
        socket_writer: W,
        options: RelayOptions,
    ) -> Self {
        Self {
            upstream: Direction::new(
                Flow::Upstream,
                stdin,
                socket_writer,
                options.buffer_capacity,
            ),
            downstream: Direction::new(
                Flow::Downstream,
                socket_reader,
                stdout,
                options.buffer_capacity,
            ),
            idle_timeout: options.idle_timeout,
        }
    }

    pub async fn run(mut self) -> RelayReport {
        let limit = self.idle_timeout;

        let outcome = loop {
            self.upstream.close_sink_if_drained(limit).await;
            self.downstream.close_sink_if_drained(limit).await;

            if let Some(flow) = self.failed_sink() {
                break RelayOutcome::SinkFailed(flow);
            }

            if self.upstream.is_drained() && self.downstream.is_drained() {
                break RelayOutcome::Drained;
            }

            match within(limit, self.wait()).await {
                Some(Some(event)) => self.dispatch(event),
                Some(None) => {
                    log::debug!("no endpoint left to wait on");
                    break RelayOutcome::Drained;
                }
                None => {
                    log::info!("no activity for {:?}, closing the relay", limit);
                    break RelayOutcome::IdleTimeout;
                }
            }
        };

        // Stdout may only report a broken pipe once its buffered writes are flushed.
        self.upstream.flush_sink(limit).await;
        self.downstream.flush_sink(limit).await;

        let outcome = match (outcome, self.failed_sink()) {
            (RelayOutcome::SinkFailed(flow), _) | (_, Some(flow)) => {
                log::error!("{}: sink is broken, abandoning the relay", flow);
                RelayOutcome::SinkFailed(flow)
            }
            (outcome, None) => outcome,
        };

        RelayReport {
            outcome,
            bytes_sent: self.upstream.relayed,
            bytes_received: self.downstream.relayed,
        }
    }

    fn failed_sink(&self) -> Option<Flow> {
        if self.upstream.sink_state == EndpointState::Error {
            Some(Flow::Upstream)
        } else if self.downstream.sink_state == EndpointState::Error {
            Some(Flow::Downstream)
        } else {
            None
        }
    }

    async fn wait(&mut self) -> Option<Event> {
        let read_stdin = self.upstream.wants_read();
        let write_socket = self.upstream.wants_write();
        let read_socket = self.downstream.wants_read();
        let write_stdout = self.downstream.wants_write();

        let (stdin, socket_writer, outgoing, stdin_space) = self.upstream.parts();
        let (socket_reader, stdout, incoming, socket_space) = self.downstream.parts();

        tokio::select! {
            result = stdin.read(stdin_space), if read_stdin => {
                Some(Event::Read(Flow::Upstream, result))
            }
            result = socket_writer.write(outgoing), if write_socket => {
                Some(Event::Wrote(Flow::Upstream, result))
            }
            result = socket_reader.read(socket_space), if read_socket => {
                Some(Event::Read(Flow::Downstream, result))
            }
            result = stdout.write(incoming), if write_stdout => {
                Some(Event::Wrote(Flow::Downstream, result))
            }
            else => None,
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Read(Flow::Upstream, result) => self.upstream.on_read(result),
            Event::Read(Flow::Downstream, result) => self.downstream.on_read(result),
            Event::Wrote(Flow::Upstream, result) => self.upstream.on_write(result),
            Event::Wrote(Flow::Downstream, result) => self.downstream.on_write(result),
        }
    }
}

/// Relays between the process's stdin/stdout and a connected socket.
pub async fn relay_stdio(stream: TcpStream, options: RelayOptions) -> RelayReport {
    let (socket_reader, socket_writer) = stream.into_split();

    StreamRelay::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
        socket_reader,
        socket_writer,
        options,
    )
    .run()
    .await
}
