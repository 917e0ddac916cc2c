//! WebSocket transport between browsers and the coordination loop

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::client::{ClientId, Connection, Outbound};
use crate::hub::HubHandle;
use shared::Message;

/// Accepts WebSocket clients and feeds their traffic to the hub
///
/// Every connection gets two tasks. The reader parses frames and submits them to the hub,
/// answering malformed frames itself. The writer drains the connection's outbound queue into
/// the socket. Neither task ever touches game state. Both stop on the connection's close
/// signal, so a peer that never answers a close cannot keep either of them alive.
pub struct Server {
    listener: TcpListener,
    hub: HubHandle,
    next_client_id: u32,
}

impl Server {
    pub async fn bind(addr: &str, hub: HubHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            hub,
            next_client_id: 1,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Only returns if the listener itself fails.
    pub async fn run(mut self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;

            let id = ClientId(self.next_client_id);
            self.next_client_id += 1;

            let hub = self.hub.clone();
            tokio::spawn(async move {
                serve(stream, addr, id, hub).await;
            });
        }
    }
}

async fn serve(stream: TcpStream, addr: SocketAddr, id: ClientId, hub: HubHandle) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (sink, frames) = socket.split();
    let (conn, outbound) = Connection::channel(id, addr);

    hub.connected(conn.clone());

    tokio::spawn(write_frames(sink, outbound, conn.clone(), hub.clone()));
    read_frames(frames, &conn, &hub).await;

    conn.signal_closed();
    hub.closed(id);
}

/// How long a closed connection may keep flushing before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Frame>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// Forwards queued frames to the socket until the queue closes or the connection is closed.
/// A failed write forces the client off the server.
async fn write_frames(mut sink: WsSink, mut outbound: mpsc::Receiver<Outbound>, conn: Connection, hub: HubHandle) {
    let id = conn.id;
    let mut signal = conn.close_signal();

    let clean = tokio::select! {
        clean = pump_frames(&mut sink, &mut outbound, id, &hub) => clean,
        _ = async {
            signal.wait().await;
            tokio::time::sleep(CLOSE_GRACE).await;
        } => false,
    };

    if !clean {
        close_sink(&mut sink, id).await;
    }

    conn.signal_closed();
    debug!("Writer for client {} finished", id);
}

/// Writes queued items in order. Returns true once an [`Outbound::Close`] was written.
async fn pump_frames(sink: &mut WsSink, outbound: &mut mpsc::Receiver<Outbound>, id: ClientId, hub: &HubHandle) -> bool {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Frame::Text(text)).await {
                    debug!("Write to client {} failed: {}", id, e);
                    hub.kill(id);
                    return false;
                }
            }
            Outbound::Close => {
                close_sink(sink, id).await;
                return true;
            }
        }
    }

    false
}

async fn close_sink(sink: &mut WsSink, id: ClientId) {
    match timeout(CLOSE_GRACE, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Closing client {} failed: {}", id, e),
        Err(_) => debug!("Client {} did not take the close in time", id),
    }
}

async fn read_frames(mut frames: WsStream, conn: &Connection, hub: &HubHandle) {
    let mut signal = conn.close_signal();

    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = signal.wait() => {
                debug!("Reader for client {} stopped by close", conn.id);
                break;
            }
        };

        let Some(frame) = frame else {
            break;
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Read from client {} failed: {}", conn.id, e);
                break;
            }
        };

        let reply = match frame {
            Frame::Text(text) => match Message::parse(&text) {
                Ok(message) => {
                    hub.message(conn.id, message);
                    None
                }
                Err(e) => {
                    debug!("Bad frame from client {}: {}", conn.id, e);
                    Some("ws_json_format_error")
                }
            },
            Frame::Binary(_) => Some("ws_non_text_error"),
            Frame::Close(_) => break,
            Frame::Ping(_) | Frame::Pong(_) | Frame::Frame(_) => None,
        };

        if let Some(kind) = reply {
            if let Err(e) = conn.send(&Message::new(kind)) {
                error!("Could not send {} to client {}: {}", kind, conn.id, e);
            }
        }
    }
}
