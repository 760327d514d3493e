//! # Single-Connection Request Pipeline
//!
//! Purpose: Own one TCP socket and drive exactly one length-framed request at
//! a time through connect, write, read-header, and read-body.
//!
//! ## Design Principles
//! 1. **Actor Pattern**: A dedicated task owns the socket and the endpoint
//!    list. The [`Connection`] handle only sends it messages, so all pipeline
//!    steps, deadline expiries, and shutdowns run one at a time.
//! 2. **Exactly-Once Completion**: Each request carries a done flag shared with
//!    its deadline timer. Whoever completes first wins; later attempts are
//!    no-ops.
//! 3. **Ordered Failover**: Endpoints are dialed in list order with no backoff.
//!    Nothing is retried once request bytes may have reached the peer.
//! 4. **Lease-Tracked Teardown**: The actor and every deadline timer hold a
//!    [`Lease`] on the connection's [`LifetimeGuard`]; [`Connection::close`]
//!    returns only after all of them are gone.
//!
//! ## Structure Overview
//!
//! ```text
//! Connection (handle)                    ConnectionTask (actor)
//!   ├── commands ──── Submit/Shutdown ──▶  ├── inbox
//!   ├── active: Arc<AtomicBool> ◀────────▶ ├── active
//!   └── guard ─────────── lease ─────────▶ ├── link: Link { endpoints, socket, phase }
//!                                          └── deadline timers ── Deadline ──▶ inbox
//! ```
//!
//! ## Phases
//!
//! `Idle` → `Connecting` (no open socket only) → `Writing` → `AwaitingHeader`
//! → `AwaitingBody` → `Idle`. A timeout, an I/O error, or a shutdown may end
//! any non-idle phase; the socket is then closed so the next request starts
//! from a fresh connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, debug_span, trace, warn, Instrument};

use fkv_common::{decode_length, frame_header, TransportError, TransportResult, FRAME_HEADER_LEN};

use crate::config::ConnectionOptions;
use crate::guard::{Lease, LifetimeGuard};
use crate::request::{Request, ResponseHandler};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Position of the active request in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Writing,
    AwaitingHeader,
    AwaitingBody,
}

/// State shared between the pipeline and the request's deadline timer.
#[derive(Debug, Default)]
struct RequestState {
    done: AtomicBool,
}

impl RequestState {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Marks the request complete. Returns false if it already was.
    fn finish(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }
}

enum Command {
    Submit(Request),
    Deadline(Arc<RequestState>),
    Shutdown,
    Close,
}

/// Handle to a single length-framed connection.
///
/// At most one request may be active at a time. Dropping the handle shuts the
/// connection down; use [`Connection::close`] to also wait for its tasks.
#[derive(Debug)]
pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    active: Arc<AtomicBool>,
    guard: LifetimeGuard,
}

impl Connection {
    /// Spawns a connection on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(endpoints: Vec<SocketAddr>, options: ConnectionOptions) -> TransportResult<Self> {
        Self::spawn(&Handle::current(), endpoints, options)
    }

    /// Spawns a connection whose tasks run on `handle`.
    ///
    /// No socket is opened until the first request arrives.
    pub fn spawn(
        handle: &Handle,
        endpoints: Vec<SocketAddr>,
        options: ConnectionOptions,
    ) -> TransportResult<Self> {
        if endpoints.is_empty() {
            return Err(TransportError::NoEndpoints);
        }

        let (commands, inbox) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(false));
        let guard = LifetimeGuard::new();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        let task = ConnectionTask {
            inbox,
            mailbox: commands.downgrade(),
            link: Link::new(endpoints, options),
            active: active.clone(),
            guard: guard.clone(),
        };
        let lease = guard.lease();
        handle.spawn(
            async move {
                let _lease = lease;
                task.run().await;
            }
            .instrument(debug_span!("connection", id)),
        );

        Ok(Connection {
            commands,
            active,
            guard,
        })
    }

    /// Hands a request to the connection.
    ///
    /// The request's handler is invoked exactly once with the response or the
    /// reason it failed.
    ///
    /// # Panics
    ///
    /// Panics if a previous request has not completed yet. Wait for its
    /// handler before submitting again.
    pub fn submit(&self, request: Request) {
        assert!(
            !self.active.swap(true, Ordering::AcqRel),
            "connection submitted again before request completion"
        );

        if let Err(mpsc::error::SendError(Command::Submit(request))) =
            self.commands.send(Command::Submit(request))
        {
            self.active.store(false, Ordering::Release);
            request.fail(TransportError::Shutdown);
        }
    }

    /// Sends `payload` and waits for the response frame.
    pub async fn send(&self, payload: impl Into<Bytes>, deadline: Option<Duration>) -> TransportResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::with_deadline(payload, deadline, move |result| {
            let _ = tx.send(result);
        }));
        rx.await.unwrap_or(Err(TransportError::Shutdown))
    }

    /// Aborts the active request, if any, and closes its socket.
    ///
    /// The aborted request completes with [`TransportError::Shutdown`]. Without
    /// an active request this does nothing, so it is safe to call repeatedly.
    /// After an abort the connection stays usable and reconnects on the next
    /// request.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Returns true while a submitted request has not completed.
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Shuts the connection down for good and waits until its actor and every
    /// deadline timer it armed have finished.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        self.guard.retire().await;
    }
}

struct ActiveRequest {
    state: Arc<RequestState>,
    handler: ResponseHandler,
    timer: Option<AbortHandle>,
}

struct ConnectionTask {
    inbox: mpsc::UnboundedReceiver<Command>,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    link: Link,
    active: Arc<AtomicBool>,
    guard: LifetimeGuard,
}

impl ConnectionTask {
    async fn run(mut self) {
        while let Some(command) = self.inbox.recv().await {
            match command {
                Command::Submit(request) => {
                    if !self.serve(request).await {
                        break;
                    }
                }
                // Expiry of a request that already completed, or a shutdown
                // with nothing to abort. The idle socket stays open.
                Command::Deadline(_) | Command::Shutdown => {}
                Command::Close => break,
            }
        }

        self.inbox.close();
        while let Ok(command) = self.inbox.try_recv() {
            if let Command::Submit(request) = command {
                self.active.store(false, Ordering::Release);
                request.fail(TransportError::Shutdown);
            }
        }
        self.link.disconnect();
        debug!("connection stopped");
    }

    /// Runs one request to completion. Returns false when the connection must
    /// stop serving afterwards.
    async fn serve(&mut self, request: Request) -> bool {
        let (payload, deadline, handler) = request.into_parts();
        let state = Arc::new(RequestState::default());
        let timer = deadline.map(|after| self.arm_deadline(state.clone(), after));
        let active = ActiveRequest {
            state,
            handler,
            timer,
        };

        let mut keep_serving = true;
        let outcome = {
            let exchange = self.link.exchange(payload);
            tokio::pin!(exchange);
            loop {
                tokio::select! {
                    result = &mut exchange => break result,
                    command = self.inbox.recv() => match command {
                        Some(Command::Deadline(expired)) => {
                            if Arc::ptr_eq(&expired, &active.state) {
                                break Err(TransportError::TimedOut);
                            }
                        }
                        Some(Command::Shutdown) => break Err(TransportError::Shutdown),
                        Some(Command::Close) | None => {
                            keep_serving = false;
                            break Err(TransportError::Shutdown);
                        }
                        Some(Command::Submit(_)) => {
                            unreachable!("submit accepted while a request is active")
                        }
                    },
                }
            }
        };

        self.report(active, outcome);
        keep_serving
    }

    /// Completes the active request and hands the outcome to its handler.
    fn report(&mut self, active: ActiveRequest, outcome: TransportResult<Bytes>) {
        let ActiveRequest {
            state,
            handler,
            timer,
        } = active;
        if !state.finish() {
            return;
        }

        if let Err(err) = &outcome {
            debug!(phase = ?self.link.phase, error = %err, "request failed");
            self.link.disconnect();
        }
        if let Some(timer) = timer {
            timer.abort();
        }
        self.link.phase = Phase::Idle;
        self.active.store(false, Ordering::Release);

        // The handler may submit the next request right away.
        drop(state);
        handler(outcome);
    }

    /// Spawns the deadline timer for one request.
    fn arm_deadline(&self, state: Arc<RequestState>, after: Duration) -> AbortHandle {
        let lease = self.guard.lease();
        let mailbox = self.mailbox.clone();
        tokio::spawn(
            async move {
                tokio::time::sleep(after).await;
                expire(lease, mailbox, state);
            }
            .in_current_span(),
        )
        .abort_handle()
    }
}

fn expire(lease: Lease, mailbox: mpsc::WeakUnboundedSender<Command>, state: Arc<RequestState>) {
    if state.is_done() || !lease.is_alive() {
        return;
    }
    if let Some(mailbox) = mailbox.upgrade() {
        trace!("deadline elapsed");
        let _ = mailbox.send(Command::Deadline(state));
    }
}

/// Socket side of the connection.
///
/// The socket is stored here only between requests. While a request is in
/// flight the exchange owns it, so dropping the exchange closes it.
struct Link {
    endpoints: Vec<SocketAddr>,
    options: ConnectionOptions,
    socket: Option<TcpStream>,
    phase: Phase,
}

impl Link {
    fn new(endpoints: Vec<SocketAddr>, options: ConnectionOptions) -> Self {
        Link {
            endpoints,
            options,
            socket: None,
            phase: Phase::Idle,
        }
    }

    async fn exchange(&mut self, payload: Bytes) -> TransportResult<Bytes> {
        let mut stream = match self.socket.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        self.phase = Phase::Writing;
        let header = frame_header(payload.len())?;
        let mut frame = Bytes::copy_from_slice(&header).chain(payload);
        stream.write_all_buf(&mut frame).await.map_err(TransportError::WriteFailed)?;
        // Release the request payload before waiting on the response.
        drop(frame);
        trace!("request frame written");

        self.phase = Phase::AwaitingHeader;
        let mut header = [0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(TransportError::ReadFailed)?;
        let len = decode_length(header) as usize;
        if let Some(limit) = self.options.max_response_len {
            if len > limit {
                return Err(TransportError::ReadFailed(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("response of {len} bytes exceeds limit of {limit}"),
                )));
            }
        }

        self.phase = Phase::AwaitingBody;
        let mut body = BytesMut::zeroed(len);
        stream.read_exact(&mut body).await.map_err(TransportError::ReadFailed)?;
        trace!(len, "response frame read");

        self.socket = Some(stream);
        Ok(body.freeze())
    }

    async fn connect(&mut self) -> TransportResult<TcpStream> {
        self.phase = Phase::Connecting;
        let (stream, endpoint) = connect_in_order(&self.endpoints, |endpoint| TcpStream::connect(endpoint)).await?;
        if self.options.nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                warn!(%endpoint, error = %err, "failed to set TCP_NODELAY");
            }
        }
        debug!(%endpoint, "connected");
        Ok(stream)
    }

    fn disconnect(&mut self) {
        if self.socket.take().is_some() {
            debug!("socket closed");
        }
    }
}

/// Dials each endpoint in list order and returns the first that connects.
///
/// When every attempt fails the error of the last endpoint is returned.
async fn connect_in_order<S, F, Fut>(endpoints: &[SocketAddr], mut dial: F) -> TransportResult<(S, SocketAddr)>
where
    F: FnMut(SocketAddr) -> Fut,
    Fut: Future<Output = io::Result<S>>,
{
    let mut last_error = None;
    for &endpoint in endpoints {
        match dial(endpoint).await {
            Ok(stream) => return Ok((stream, endpoint)),
            Err(source) => {
                debug!(%endpoint, error = %source, "connect attempt failed");
                last_error = Some(TransportError::ConnectFailed { endpoint, source });
            }
        }
    }
    Err(last_error.unwrap_or(TransportError::NoEndpoints))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::ready;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn dials_endpoints_in_order_until_one_connects() {
        let (a, b, c) = (addr(1001), addr(1002), addr(1003));
        let mut attempts = Vec::new();
        let (stream, endpoint) = connect_in_order(&[a, b, c], |endpoint| {
            attempts.push(endpoint);
            ready(if endpoint == c {
                Ok("stream-c")
            } else {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            })
        })
        .await
        .unwrap();

        assert_eq!(attempts, vec![a, b, c]);
        assert_eq!(endpoint, c);
        assert_eq!(stream, "stream-c");
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let (a, b) = (addr(2001), addr(2002));
        let mut attempts = Vec::new();
        let (_, endpoint) = connect_in_order(&[a, b], |endpoint| {
            attempts.push(endpoint);
            ready(Ok::<_, io::Error>(()))
        })
        .await
        .unwrap();

        assert_eq!(attempts, vec![a]);
        assert_eq!(endpoint, a);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_endpoint() {
        let (a, b) = (addr(3001), addr(3002));
        let mut attempts = Vec::new();
        let err = connect_in_order(&[a, b], |endpoint| {
            attempts.push(endpoint);
            let kind = if endpoint == a {
                io::ErrorKind::ConnectionRefused
            } else {
                io::ErrorKind::TimedOut
            };
            ready(Err::<(), _>(io::Error::from(kind)))
        })
        .await
        .unwrap_err();

        assert_eq!(attempts, vec![a, b]);
        match err {
            TransportError::ConnectFailed { endpoint, source } => {
                assert_eq!(endpoint, b);
                assert_eq!(source.kind(), io::ErrorKind::TimedOut);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn completion_flag_is_set_once() {
        let state = RequestState::default();
        assert!(!state.is_done());
        assert!(state.finish());
        assert!(!state.finish());
        assert!(state.is_done());
    }

    #[tokio::test]
    async fn rejects_empty_endpoint_list() {
        let result = Connection::new(Vec::new(), ConnectionOptions::default());
        assert!(matches!(result, Err(TransportError::NoEndpoints)));
    }

    #[tokio::test]
    async fn expired_timer_ignores_completed_request() {
        let guard = LifetimeGuard::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(RequestState::default());
        state.finish();

        expire(guard.lease(), tx.downgrade(), state);
        assert!(rx.try_recv().is_err());
        assert_eq!(guard.outstanding(), 0);
    }

    #[tokio::test]
    async fn expired_timer_posts_deadline_for_pending_request() {
        let guard = LifetimeGuard::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = Arc::new(RequestState::default());

        expire(guard.lease(), tx.downgrade(), state.clone());
        match rx.try_recv() {
            Ok(Command::Deadline(expired)) => assert!(Arc::ptr_eq(&expired, &state)),
            _ => panic!("expected a deadline command"),
        }
    }
}
