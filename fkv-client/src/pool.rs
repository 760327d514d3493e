//! # Connection Pool
//!
//! Purpose: Spread requests over a fixed set of single-request connections
//! and cap how many requests may be queued or in flight at once.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Connections are created once and reused; each
//!    one serves a single request at a time.
//! 2. **Backpressure**: A semaphore sized by the highwatermark admits
//!    requests. The permit travels with the request and is released when its
//!    handler runs.
//! 3. **Single Dispatcher**: One task owns the idle list and the overflow
//!    queue, so dispatching needs no locks.
//! 4. **Round-Robin Reuse**: Idle connections are handed out oldest first.
//!    A connection whose handler panicked is replaced before it is reused.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::lookup_host;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info_span, warn, Instrument};

use fkv_common::{TransportError, TransportResult};

use crate::config::{ConnectionOptions, PoolConfig};
use crate::connection::Connection;
use crate::guard::LifetimeGuard;
use crate::request::{Request, ResponseHandler};

/// Resolves `host` into the ordered endpoint list a connection fails over on.
pub async fn resolve_endpoints(host: &str, port: u16) -> TransportResult<Vec<SocketAddr>> {
    let endpoints: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            source,
        })?
        .collect();
    if endpoints.is_empty() {
        return Err(TransportError::NoEndpoints);
    }
    Ok(endpoints)
}

enum Dispatch {
    Request(Request),
    Released(usize),
    Crashed(usize),
    Shutdown,
}

/// Pool of connections sharing one endpoint list.
#[derive(Debug)]
pub struct ConnectionPool {
    dispatch: mpsc::UnboundedSender<Dispatch>,
    permits: Arc<Semaphore>,
    highwatermark: usize,
    guard: LifetimeGuard,
}

impl ConnectionPool {
    /// Creates a pool on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(endpoints: Vec<SocketAddr>, config: PoolConfig) -> TransportResult<Self> {
        let handle = Handle::current();
        let size = config.connections.max(1);
        let highwatermark = config.highwatermark.clamp(1, Semaphore::MAX_PERMITS);

        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            connections.push(Connection::spawn(&handle, endpoints.clone(), config.options.clone())?);
        }

        let (dispatch, inbox) = mpsc::unbounded_channel();
        let guard = LifetimeGuard::new();
        let dispatcher = Dispatcher {
            inbox,
            mailbox: dispatch.downgrade(),
            handle: handle.clone(),
            endpoints,
            options: config.options,
            connections,
            idle: (0..size).collect(),
            queue: VecDeque::new(),
        };
        let lease = guard.lease();
        handle.spawn(
            async move {
                let _lease = lease;
                dispatcher.run().await;
            }
            .instrument(info_span!("pool", connections = size)),
        );

        Ok(ConnectionPool {
            dispatch,
            permits: Arc::new(Semaphore::new(highwatermark)),
            highwatermark,
            guard,
        })
    }

    /// Resolves `host` and creates a pool over the resulting endpoints.
    pub async fn connect(host: &str, port: u16, config: PoolConfig) -> TransportResult<Self> {
        let endpoints = resolve_endpoints(host, port).await?;
        debug!(host, port, endpoints = endpoints.len(), "resolved endpoints");
        Self::new(endpoints, config)
    }

    /// Queues a request, waiting while the highwatermark is reached.
    pub async fn submit(&self, request: Request) {
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => self.enqueue(request, permit),
            Err(_) => request.fail(TransportError::Shutdown),
        }
    }

    /// Queues a request without waiting.
    ///
    /// When the highwatermark is reached the request completes immediately
    /// with [`TransportError::Backpressure`].
    pub fn try_submit(&self, request: Request) {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => self.enqueue(request, permit),
            Err(TryAcquireError::NoPermits) => request.fail(TransportError::Backpressure),
            Err(TryAcquireError::Closed) => request.fail(TransportError::Shutdown),
        }
    }

    /// Sends `payload` on the next free connection and waits for the response.
    pub async fn send(&self, payload: impl Into<Bytes>, deadline: Option<Duration>) -> TransportResult<Bytes> {
        let (tx, rx) = oneshot::channel();
        self.submit(Request::with_deadline(payload, deadline, move |result| {
            let _ = tx.send(result);
        }))
        .await;
        rx.await.unwrap_or(Err(TransportError::Shutdown))
    }

    /// Requests currently queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.highwatermark - self.permits.available_permits()
    }

    /// Stops accepting requests, fails the queued ones, and waits until every
    /// connection has shut down.
    pub async fn close(self) {
        self.permits.close();
        let _ = self.dispatch.send(Dispatch::Shutdown);
        self.guard.retire().await;
    }

    fn enqueue(&self, request: Request, permit: OwnedSemaphorePermit) {
        let request = request.map_handler(move |handler| -> ResponseHandler {
            Box::new(move |result: TransportResult<Bytes>| {
                drop(permit);
                handler(result);
            })
        });
        if let Err(mpsc::error::SendError(Dispatch::Request(request))) =
            self.dispatch.send(Dispatch::Request(request))
        {
            request.fail(TransportError::Shutdown);
        }
    }
}

struct Dispatcher {
    inbox: mpsc::UnboundedReceiver<Dispatch>,
    mailbox: mpsc::WeakUnboundedSender<Dispatch>,
    handle: Handle,
    endpoints: Vec<SocketAddr>,
    options: ConnectionOptions,
    connections: Vec<Connection>,
    idle: VecDeque<usize>,
    queue: VecDeque<Request>,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            match message {
                Dispatch::Request(request) => match self.idle.pop_front() {
                    Some(index) => self.assign(index, request),
                    None => self.queue.push_back(request),
                },
                Dispatch::Released(index) => self.release(index),
                Dispatch::Crashed(index) => {
                    if self.replace(index) {
                        self.release(index);
                    }
                }
                Dispatch::Shutdown => break,
            }
        }

        debug!(queued = self.queue.len(), "pool shutting down");
        for request in self.queue.drain(..) {
            request.fail(TransportError::Shutdown);
        }
        for connection in std::mem::take(&mut self.connections) {
            connection.close().await;
        }

        self.inbox.close();
        while let Ok(message) = self.inbox.try_recv() {
            if let Dispatch::Request(request) = message {
                request.fail(TransportError::Shutdown);
            }
        }
    }

    fn release(&mut self, index: usize) {
        match self.queue.pop_front() {
            Some(request) => self.assign(index, request),
            None => self.idle.push_back(index),
        }
    }

    /// Swaps in a fresh connection for one whose task died. Returns false if
    /// the slot had to be retired instead.
    fn replace(&mut self, index: usize) -> bool {
        match Connection::spawn(&self.handle, self.endpoints.clone(), self.options.clone()) {
            Ok(connection) => {
                warn!(connection = index, "response handler panicked, replacing connection");
                self.connections[index] = connection;
                true
            }
            Err(err) => {
                warn!(connection = index, error = %err, "response handler panicked, retiring connection");
                false
            }
        }
    }

    fn assign(&mut self, index: usize, request: Request) {
        let slot = Slot {
            mailbox: self.mailbox.clone(),
            index,
        };
        let request = request.map_handler(move |handler| -> ResponseHandler {
            Box::new(move |result: TransportResult<Bytes>| {
                let _slot = slot;
                handler(result);
            })
        });
        self.connections[index].submit(request);
    }
}

/// Hands a connection back to the dispatcher once its handler has returned
/// or unwound.
struct Slot {
    mailbox: mpsc::WeakUnboundedSender<Dispatch>,
    index: usize,
}

impl Drop for Slot {
    fn drop(&mut self) {
        // A panicking handler takes the connection task down with it.
        let message = if std::thread::panicking() {
            Dispatch::Crashed(self.index)
        } else {
            Dispatch::Released(self.index)
        };
        if let Some(mailbox) = self.mailbox.upgrade() {
            let _ = mailbox.send(message);
        }
    }
}
