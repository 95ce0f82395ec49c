//! WebSocket transport.
//!
//! Each connection owns a dedicated worker thread running a current-thread
//! tokio runtime. The worker is the only owner of the socket: inbound frames
//! are read there and outbound frames arrive through an unbounded command
//! channel, so `send_text` can be called from any thread.
//!
//! All [`ConnectionHandler`] callbacks run on the worker thread, one at a time,
//! with one exception: closing a connection that was never started reports
//! `on_closed` from the calling thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::TransportError;

/// Receiver of connection lifecycle and frame callbacks.
pub trait ConnectionHandler: Send + Sync {
    /// The WebSocket handshake completed.
    fn on_open(&self);

    /// A text frame arrived.
    fn on_text_frame(&self, payload: &str);

    /// The connection is gone. Called exactly once per connection.
    fn on_closed(&self, reason: &str);

    /// The transport failed. Followed by `on_closed`.
    fn on_error(&self, error: &TransportError);
}

enum Command {
    Text(String),
    Close(String),
}

enum State {
    Idle,
    Running { commands: UnboundedSender<Command> },
    Closed,
}

struct Shared {
    url: Url,
    thread_name: String,
    handler: Weak<dyn ConnectionHandler>,
    state: Mutex<State>,
    open: AtomicBool,
    closed_notified: AtomicBool,
}

impl Shared {
    fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler.upgrade()
    }

    fn report_error(&self, err: &TransportError) {
        error!("Connection to {} failed: {}", self.url, err);
        if let Some(handler) = self.handler() {
            handler.on_error(err);
        }
    }

    fn notify_closed(&self, reason: &str) {
        if self.closed_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Connection to {} closed: {}", self.url, reason);
        if let Some(handler) = self.handler() {
            handler.on_closed(reason);
        }
    }
}

/// A single client-side WebSocket connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct WebSocketConnection {
    shared: Arc<Shared>,
}

impl WebSocketConnection {
    /// Create an unstarted connection to `url`.
    ///
    /// The handler is held weakly so an owner may store the connection inside
    /// the handler itself.
    pub fn new(url: Url, thread_name: impl Into<String>, handler: Weak<dyn ConnectionHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url,
                thread_name: thread_name.into(),
                handler,
                state: Mutex::new(State::Idle),
                open: AtomicBool::new(false),
                closed_notified: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Whether the WebSocket handshake has completed and the socket is still up.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Start the connection worker. Returns as soon as the worker is running;
    /// completion is reported through [`ConnectionHandler::on_open`].
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` if the connection was already started or closed,
    /// `Worker` if the worker thread could not be spawned.
    pub fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if !matches!(*state, State::Idle) {
            return Err(TransportError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.thread_name.clone())
            .spawn(move || run_worker(shared, rx));

        match spawned {
            Ok(_) => {
                info!("Connecting to {}", self.shared.url);
                *state = State::Running { commands: tx };
                Ok(())
            }
            Err(e) => {
                *state = State::Closed;
                Err(TransportError::Worker(e))
            }
        }
    }

    /// Queue a text frame. Frames sent before `connect` or after close are
    /// logged and dropped.
    pub fn send_text(&self, payload: impl Into<String>) {
        let state = self.shared.state.lock();
        match &*state {
            State::Running { commands } => {
                if commands.send(Command::Text(payload.into())).is_err() {
                    warn!("Dropping frame, connection worker has exited");
                }
            }
            State::Idle => warn!("Dropping frame, connection not started"),
            State::Closed => warn!("Dropping frame, connection closed"),
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.close_with_reason("closed by client");
    }

    /// Close the connection, reporting `reason` to the closed callback.
    pub fn close_with_reason(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let previous = std::mem::replace(&mut *self.shared.state.lock(), State::Closed);
        match previous {
            State::Idle => self.shared.notify_closed(&reason),
            State::Running { commands } => {
                // Worker already gone; report the close ourselves.
                if commands.send(Command::Close(reason.clone())).is_err() {
                    self.shared.notify_closed(&reason);
                }
            }
            State::Closed => {}
        }
    }
}

fn run_worker(shared: Arc<Shared>, commands: UnboundedReceiver<Command>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            shared.report_error(&TransportError::Worker(e));
            shared.notify_closed("failed to start runtime");
            return;
        }
    };

    let reason = runtime.block_on(drive(&shared, commands));

    shared.open.store(false, Ordering::SeqCst);
    *shared.state.lock() = State::Closed;
    shared.notify_closed(&reason);
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the socket while still honouring commands queued during the handshake.
///
/// Frames queued before the handshake completes are returned for delivery
/// once the socket is up. A close request abandons the handshake.
async fn open_socket(
    shared: &Shared,
    commands: &mut UnboundedReceiver<Command>,
) -> Result<(Socket, Vec<String>), String> {
    let connecting = connect_async(shared.url.as_str());
    tokio::pin!(connecting);
    let mut pending = Vec::new();

    loop {
        tokio::select! {
            result = &mut connecting => {
                return match result {
                    Ok((ws, _response)) => Ok((ws, pending)),
                    Err(e) => {
                        let reason = e.to_string();
                        shared.report_error(&TransportError::ConnectionFailed(e));
                        Err(reason)
                    }
                };
            }
            command = commands.recv() => match command {
                Some(Command::Text(payload)) => pending.push(payload),
                Some(Command::Close(reason)) => {
                    debug!("Close requested while connecting to {}", shared.url);
                    return Err(reason);
                }
                None => return Err("connection dropped".to_string()),
            },
        }
    }
}

/// Run the socket until either side closes it. Returns the close reason.
async fn drive(shared: &Shared, mut commands: UnboundedReceiver<Command>) -> String {
    let (mut ws, pending) = match open_socket(shared, &mut commands).await {
        Ok(opened) => opened,
        Err(reason) => return reason,
    };

    info!("Connected to {}", shared.url);
    shared.open.store(true, Ordering::SeqCst);
    if let Some(handler) = shared.handler() {
        handler.on_open();
    }

    for payload in pending {
        debug!("-> {}", payload);
        if let Err(e) = ws.send(Message::Text(payload)).await {
            let reason = e.to_string();
            shared.report_error(&TransportError::WebSocket(e));
            return reason;
        }
    }

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    debug!("<- {}", text);
                    if let Some(handler) = shared.handler() {
                        handler.on_text_frame(&text);
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring binary frame ({} bytes)", data.len());
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = ws.send(Message::Pong(data)).await {
                        let reason = e.to_string();
                        shared.report_error(&TransportError::WebSocket(e));
                        return reason;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    // Deliver the queued close reply.
                    if let Err(e) = ws.flush().await {
                        debug!("Close reply failed: {}", e);
                    }
                    return match frame {
                        Some(frame) if !frame.reason.is_empty() => frame.reason.to_string(),
                        _ => "closed by server".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let reason = e.to_string();
                    shared.report_error(&TransportError::WebSocket(e));
                    return reason;
                }
                None => return "connection lost".to_string(),
            },
            command = commands.recv() => match command {
                Some(Command::Text(payload)) => {
                    debug!("-> {}", payload);
                    if let Err(e) = ws.send(Message::Text(payload)).await {
                        let reason = e.to_string();
                        shared.report_error(&TransportError::WebSocket(e));
                        let _ = ws.close(None).await;
                        return reason;
                    }
                }
                Some(Command::Close(reason)) => {
                    if let Err(e) = ws.close(None).await {
                        debug!("Close handshake failed: {}", e);
                    }
                    return reason;
                }
                None => {
                    let _ = ws.close(None).await;
                    return "connection dropped".to_string();
                }
            },
        }
    }
}
