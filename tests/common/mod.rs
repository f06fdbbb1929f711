//! Shared helpers for the integration suites: tracing init and a raw
//! WebSocket client that speaks the wire format directly, for tests that
//! need to observe raw fan-out frames or misbehave on purpose.
#![allow(dead_code)]

use duplex_rpc::codec::{self, CallEnvelope, JsonMap, ResultEnvelope};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn ws_url(addr: SocketAddr, token: &str) -> String {
    format!("ws://127.0.0.1:{}/?token={}", addr.port(), token)
}

/// Dialable host for a server bound on the wildcard address.
pub fn host(addr: SocketAddr) -> String {
    format!("127.0.0.1:{}", addr.port())
}

/// A bare protocol client: no auto-heartbeat, no dispatcher.  Tests use
/// it to drive the wire by hand and to watch raw broadcast frames.
pub struct RawClient {
    pub ws: WsStream,
}

impl RawClient {
    /// Dial with a freshly minted admission token.
    pub async fn connect(addr: SocketAddr, secret: &str) -> RawClient {
        let token = duplex_rpc::admission_token(secret).expect("mint token");
        Self::connect_with_token(addr, &token)
            .await
            .expect("upgrade should succeed")
    }

    /// Dial with an explicit token; surfaces handshake rejection.
    pub async fn connect_with_token(
        addr: SocketAddr,
        token: &str,
    ) -> Result<RawClient, tokio_tungstenite::tungstenite::Error> {
        let (ws, _response) = connect_async(ws_url(addr, token).as_str()).await?;
        Ok(RawClient { ws })
    }

    pub async fn send_frame(&mut self, frame: Vec<u8>) {
        self.ws
            .send(Message::Binary(frame.into()))
            .await
            .expect("send frame");
    }

    pub async fn send_beat(&mut self) {
        self.ws
            .send(Message::Text("@".to_owned().into()))
            .await
            .expect("send beat");
    }

    /// Invoke `waiter.method` and wait for the matching result envelope.
    pub async fn call(&mut self, waiter: &str, method: &str, input: JsonMap) -> ResultEnvelope {
        let envelope = CallEnvelope::new(waiter, method, input, "t3st");
        let frame = codec::encode(&envelope).expect("encode call");
        self.send_frame(frame).await;
        loop {
            let payload = self.next_payload().await.expect("result frame");
            if let Some(result) = codec::decode_result(&payload) {
                if result.correlation == "t3st" {
                    return result;
                }
            }
        }
    }

    /// Next non-heartbeat frame payload, or `None` on close/timeout.
    pub async fn next_payload(&mut self) -> Option<Vec<u8>> {
        loop {
            let message =
                tokio::time::timeout(Duration::from_secs(5), self.ws.next()).await.ok()??;
            match message.ok()? {
                Message::Binary(b) => return Some(b.to_vec()),
                Message::Text(t) if t.as_str() == "@" => continue,
                Message::Text(t) => return Some(t.as_bytes().to_vec()),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Expect no frame to arrive within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let got = tokio::time::timeout(window, self.ws.next()).await;
        assert!(got.is_err(), "expected silence, got {got:?}");
    }
}

/// Wait (bounded) for a condition that flips as background tasks settle.
pub async fn wait_until<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Async-condition variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Build a single-entry input map.
pub fn map_of(key: &str, value: serde_json::Value) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert(key.to_owned(), value);
    map
}
