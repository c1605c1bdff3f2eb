use std::{
    fmt::Display,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex as SyncMutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Mutex, Semaphore},
    time::{timeout_at, Instant},
};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message as Frame},
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{
    pending::{PendingRequests, SlotGuard},
    ConnectionError, RequestHandler,
};
use crate::message::{Message, Request, Response};

/// Maximum number of incoming requests handled concurrently.
pub const MAX_NUM_REQUESTS: usize = 16;
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
/// The connection is dead if no pong arrived for this long.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const TOO_MANY_REQUESTS: &str = "Exceeding maximum number of allowed open requests";

type FrameSink = Pin<Box<dyn Sink<Frame, Error = WsError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, WsError>> + Send>>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// One websocket to a remote participant.
///
/// Writes are serialized, reads happen from a single task at a time. Each
/// outgoing request gets a fresh id, its response is routed back to the
/// caller waiting in [Connection::request].
pub struct Connection {
    sink: Mutex<FrameSink>,
    stream: Mutex<FrameStream>,
    request_counter: AtomicU64,
    pending: PendingRequests,
    read_deadline: SyncMutex<Option<Instant>>,
    closing: AtomicBool,
    closed: CancellationToken,
    on_close: SyncMutex<Option<CloseHook>>,
}

impl Connection {
    pub fn new<S>(ws: WebSocketStream<S>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Arc::new(Self {
            sink: Mutex::new(Box::pin(sink)),
            stream: Mutex::new(Box::pin(stream)),
            request_counter: AtomicU64::new(0),
            pending: PendingRequests::default(),
            read_deadline: SyncMutex::new(None),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            on_close: SyncMutex::new(None),
        })
    }

    /// Read the next message, skipping control frames.
    pub async fn read(&self) -> Result<Message, ConnectionError> {
        let mut stream = self.stream.lock().await;
        loop {
            let deadline = *self.read_deadline.lock();
            let next = match deadline {
                Some(deadline) => timeout_at(deadline, stream.next())
                    .await
                    .map_err(|_| ConnectionError::Timeout("no pong from peer"))?,
                None => stream.next().await,
            };
            match next.ok_or(ConnectionError::Closed)?? {
                Frame::Text(text) => return Ok(Message::decode(&text)?),
                Frame::Pong(_) => self.renew_read_deadline(),
                // Pings are answered by the websocket itself.
                Frame::Ping(_) | Frame::Frame(_) => {}
                Frame::Close(_) => return Err(ConnectionError::Closed),
                Frame::Binary(_) => return Err(ConnectionError::InvalidFrame("binary")),
            }
        }
    }

    pub async fn write(&self, msg: &Message) -> Result<(), ConnectionError> {
        let text = msg.encode()?;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.sink.lock().await.send(Frame::Text(text)).await?;
        Ok(())
    }

    /// Send `msg` as a request and wait for the response.
    ///
    /// Blocks until the response arrives or the connection closes, callers
    /// bound it with [Connection::request_timeout] or their own deadline.
    /// Dropping the future forgets the request, a late response is dropped.
    pub async fn request(&self, msg: Message) -> Result<Message, ConnectionError> {
        let id = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let rx = self.pending.insert(id);
        let _guard = SlotGuard {
            pending: &self.pending,
            id,
        };
        self.write(&Message::Request(Request {
            id,
            message: Box::new(msg),
        }))
        .await?;
        rx.await.map_err(|_| ConnectionError::Closed)
    }

    pub async fn request_timeout(
        &self,
        msg: Message,
        timeout: Duration,
        what: &'static str,
    ) -> Result<Message, ConnectionError> {
        tokio::time::timeout(timeout, self.request(msg))
            .await
            .map_err(|_| ConnectionError::Timeout(what))?
    }

    /// Serve the connection until it is closed or a read fails.
    ///
    /// Responses are routed to their waiting requests, requests are handled
    /// concurrently by `handler`, at most [MAX_NUM_REQUESTS] at a time. Also
    /// keeps the connection alive with pings, a peer that stops answering
    /// them is dropped.
    pub async fn handle<H: RequestHandler>(
        self: &Arc<Self>,
        handler: Arc<H>,
    ) -> Result<(), ConnectionError> {
        self.renew_read_deadline();
        tokio::spawn(self.clone().keep_alive());

        let gate = Arc::new(Semaphore::new(MAX_NUM_REQUESTS));
        loop {
            let msg = tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                msg = self.read() => msg,
            };
            let msg = match msg {
                Ok(msg) => msg,
                Err(_) if self.is_closed() => return Ok(()),
                Err(err) => {
                    self.close().await;
                    return Err(err);
                }
            };

            match msg {
                Message::Response(resp) => {
                    if !self.pending.resolve(resp.id, *resp.message) {
                        warn!(id = resp.id, "dropping response without open request");
                    }
                }
                Message::Request(req) => {
                    let conn = self.clone();
                    match gate.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                let resp = handler.handle_request(*req.message).await;
                                conn.respond(req.id, resp).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            debug!(id = req.id, "too many open requests");
                            tokio::spawn(async move {
                                conn.respond(req.id, Message::error(TOO_MANY_REQUESTS)).await;
                            });
                        }
                    }
                }
                other => handler.handle_notification(other).await,
            }
        }
    }

    async fn respond(&self, id: u64, msg: Message) {
        let resp = Message::Response(Response {
            id,
            message: Box::new(msg),
        });
        if let Err(err) = self.write(&resp).await {
            warn!(id, %err, "sending response");
        }
    }

    fn renew_read_deadline(&self) {
        *self.read_deadline.lock() = Some(Instant::now() + PONG_TIMEOUT);
    }

    async fn keep_alive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let sent = self.sink.lock().await.send(Frame::Ping(Vec::new())).await;
            if let Err(err) = sent {
                error!(%err, "sending ping, closing connection");
                self.close().await;
                return;
            }
        }
    }

    /// Run `hook` once the connection closes. Runs right away if it is
    /// closed already.
    pub fn set_on_close(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_closed() {
            hook();
            return;
        }
        *self.on_close.lock() = Some(Box::new(hook));
        // Closed while installing, the closer may have missed the hook.
        if self.is_closed() {
            if let Some(hook) = self.on_close.lock().take() {
                hook();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Close the connection. Open requests fail, the close hook runs. Further
    /// calls do nothing.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        if let Some(hook) = self.on_close.lock().take() {
            hook();
        }
        self.pending.clear();

        let shutdown = async { self.sink.lock().await.close().await };
        match tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await {
            Ok(Err(err)) => debug!(%err, "closing websocket"),
            Err(_) => debug!("closing websocket timed out"),
            Ok(Ok(())) => {}
        }
    }

    /// Tell the peer why the connection is dropped, then close it.
    pub async fn close_with_error(&self, err: impl Display) {
        if let Err(write_err) = self.write(&Message::error(&err)).await {
            debug!(%write_err, "sending close reason");
        }
        self.close().await;
    }
}
