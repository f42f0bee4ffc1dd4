// mock_upstream: a bare WebSocket server test double for driving
// `UpstreamSession` through its connect/subscribe/stream states without
// talking to a real exchange.
//
// Each accepted TCP connection is handed out as a `MockUpstreamConnection`
// once the WebSocket handshake completes, letting a test script frames at
// its own pace and inspect what the connector sent.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock upstream WebSocket server, bound to a random local port.
///
/// Connections are delivered through [`MockUpstreamServer::accept`] in the
/// order they're established. One instance is usually enough per test:
/// sessions that restart reconnect to the same address and show up as a
/// new `MockUpstreamConnection`.
pub struct MockUpstreamServer {
    addr: SocketAddr,
    connections: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockUpstreamConnection>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockUpstreamServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock upstream listener");
        let addr = listener.local_addr().expect("mock upstream local_addr");
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            accept_loop(listener, conn_tx).await;
        });

        MockUpstreamServer { addr, connections: tokio::sync::Mutex::new(conn_rx), _task: task }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The `ws://` URL a connector's `SubscribeRequest::url` should point at.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Wait for the next WebSocket handshake to complete.
    pub async fn accept(&self) -> MockUpstreamConnection {
        self.connections.lock().await.recv().await.expect("mock upstream accept loop ended")
    }
}

async fn accept_loop(listener: TcpListener, conn_tx: mpsc::UnboundedSender<MockUpstreamConnection>) {
    loop {
        let (stream, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let conn_tx = conn_tx.clone();
        tokio::spawn(async move {
            handle_connection(stream, conn_tx).await;
        });
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, conn_tx: mpsc::UnboundedSender<MockUpstreamConnection>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let incoming = Arc::new(Mutex::new(VecDeque::new()));
    let notify = Arc::new(Notify::new());

    let conn = MockUpstreamConnection {
        out_tx: out_tx.clone(),
        incoming: Arc::clone(&incoming),
        notify: Arc::clone(&notify),
    };
    if conn_tx.send(conn).is_err() {
        return;
    }

    let write_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = read.next().await {
        match msg {
            Message::Text(t) => {
                incoming.lock().expect("incoming mutex poisoned").push_back(t.to_string());
                notify.notify_waiters();
            }
            Message::Ping(data) => {
                let _ = out_tx.send(Message::Pong(data));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    write_task.abort();
}

/// One accepted connection from an `UpstreamSession`.
pub struct MockUpstreamConnection {
    out_tx: mpsc::UnboundedSender<Message>,
    incoming: Arc<Mutex<VecDeque<String>>>,
    notify: Arc<Notify>,
}

impl MockUpstreamConnection {
    /// Push a text frame to the connected session, as if it came from the
    /// exchange.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.out_tx.send(Message::Text(text.into().into()));
    }

    /// Close the connection from the server side, simulating a dropped
    /// upstream feed.
    pub fn close(&self) {
        let _ = self.out_tx.send(Message::Close(None));
    }

    /// Wait for the next text frame the session sent (its subscribe
    /// payload, pings, etc).
    pub async fn recv_text(&self) -> Option<String> {
        loop {
            if let Some(text) = self.incoming.lock().expect("incoming mutex poisoned").pop_front() {
                return Some(text);
            }
            self.notify.notified().await;
        }
    }
}
