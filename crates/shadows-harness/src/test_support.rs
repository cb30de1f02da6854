use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{HarnessConfig, HarnessConfigBuilder};

/// Config whose "node" is `/bin/sh -c <script>`.
pub(crate) fn sh_node(script: &str) -> HarnessConfigBuilder {
    with_script(HarnessConfig::builder().without_types_bundle(), script)
}

pub(crate) fn with_script(builder: HarnessConfigBuilder, script: &str) -> HarnessConfigBuilder {
    builder.binary_path("/bin/sh").spawn_args(["-c", script])
}

/// WebSocket JSON-RPC server answering like a freshly started dev node.
pub(crate) struct FakeNode {
    port: u16,
    connections: Arc<AtomicUsize>,
    accept_loop: JoinHandle<()>,
}

impl FakeNode {
    pub(crate) async fn start() -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let blocks = Arc::new(AtomicU64::new(0));

        let counter = connections.clone();
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, blocks.clone()));
            }
        });
        FakeNode { port, connections, accept_loop }
    }

    pub(crate) fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Builder pointing the WebSocket port at this server; the HTTP port is
    /// never served.
    pub(crate) fn config(&self) -> HarnessConfigBuilder {
        HarnessConfig::builder().ports(19951, 19952, self.port)
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn serve(stream: TcpStream, blocks: Arc<AtomicU64>) {
    let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    while let Some(Ok(message)) = socket.next().await {
        let request: Value = match message {
            Message::Text(text) => match serde_json::from_str(&text) {
                Ok(request) => request,
                Err(_) => continue,
            },
            Message::Close(_) => break,
            _ => continue,
        };
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default();
        let response = match answer(method, &blocks) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };
        if socket.send(Message::Text(response.to_string())).await.is_err() {
            break;
        }
    }
}

fn answer(method: &str, blocks: &AtomicU64) -> Result<Value, (i64, &'static str)> {
    match method {
        "state_getRuntimeVersion" => Ok(json!({
            "specName": "node-shadows",
            "implName": "node-shadows",
            "authoringVersion": 3,
            "specVersion": 7,
            "implVersion": 0,
            "transactionVersion": 1
        })),
        "eth_chainId" => Ok(json!("0x2a")),
        "eth_blockNumber" => Ok(json!(format!("{:#x}", blocks.load(Ordering::SeqCst)))),
        "engine_createBlock" => {
            let number = blocks.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"hash": format!("0x{:064x}", number), "aux": {"header_only": false}}))
        }
        "engine_finalizeBlock" => Ok(json!(true)),
        "system_chain" => Ok(json!("Development")),
        _ => Err((-32601, "Method not found")),
    }
}
