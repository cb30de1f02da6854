use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{JsonRpcRequest, JsonRpcResponse, Transport};
use crate::errors::{HarnessError, HarnessErrorExt, HarnessResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Multiplexed WebSocket transport.
///
/// Requests get a connection-unique id on the wire so that concurrent calls
/// can share the socket; the caller's id is restored on the response.
pub struct WsTransport {
    url: String,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    pending: PendingRequests,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl WsTransport {
    pub async fn connect(url: impl Into<String>) -> HarnessResult<WsTransport> {
        let url = url.into();
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Report::new(e).change_context(HarnessError::Connection))
            .attach_printable_lazy(|| format!("unable to open websocket {}", url))?;

        let (sink, source) = stream.split();
        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_responses(source, pending.clone(), connected.clone()));

        Ok(WsTransport {
            url,
            sink: Mutex::new(Some(sink)),
            pending,
            next_id: AtomicU64::new(1),
            connected,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

async fn read_responses(
    mut source: SplitStream<WsStream>,
    pending: PendingRequests,
    connected: Arc<AtomicBool>,
) {
    while let Some(message) = source.next().await {
        let payload = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        // subscription notifications carry no id and are dropped
        let Ok(response) = serde_json::from_slice::<JsonRpcResponse>(&payload) else {
            continue;
        };
        let Some(id) = response.id else { continue };
        if let Some(waiter) = pending.lock().await.remove(&id) {
            let _ = waiter.send(response);
        }
    }
    connected.store(false, Ordering::SeqCst);
    // dropping the senders fails every call still waiting
    pending.lock().await.clear();
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, request: &JsonRpcRequest) -> HarnessResult<JsonRpcResponse> {
        let wire_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut outgoing = request.clone();
        outgoing.id = wire_id;
        let payload = serde_json::to_string(&outgoing)
            .map_err(|e| Report::new(e).change_context(HarnessError::InvalidResponse))?;

        let (waiter, response) = oneshot::channel();
        {
            // the reader flips `connected` before clearing this map
            let mut pending = self.pending.lock().await;
            if !self.is_connected() {
                return Err(harness_error!(HarnessError::Connection, "websocket {} is disconnected", self.url))
                    .with_rpc_context(&self.url, &request.method, Some(request.display_params()));
            }
            pending.insert(wire_id, waiter);
        }

        let sent = {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink
                    .send(Message::Text(payload))
                    .await
                    .map_err(|e| Report::new(e).change_context(HarnessError::Connection)),
                None => Err(harness_error!(HarnessError::Connection, "websocket {} is disconnected", self.url)),
            }
        };
        if let Err(report) = sent {
            self.pending.lock().await.remove(&wire_id);
            return Err(report).with_rpc_context(&self.url, &request.method, Some(request.display_params()));
        }

        let mut response = response
            .await
            .map_err(|_| {
                harness_error!(
                    HarnessError::Connection,
                    "websocket {} closed before answering {}",
                    self.url,
                    request.method
                )
            })
            .with_rpc_context(&self.url, &request.method, Some(request.display_params()))?;
        response.id = Some(request.id);
        Ok(response)
    }

    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.pending.lock().await.clear();
    }
}
