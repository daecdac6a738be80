use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, Method, StatusCode},
    response::Response,
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{net::TcpListener, sync::RwLock};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub value: Value,
}

/// What `/echo` saw.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Echo {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Default)]
pub struct Store {
    next_id: u64,
    items: Vec<Item>,
}

pub type Db = Arc<RwLock<Store>>;

pub fn app() -> Router {
    let db: Db = Arc::new(RwLock::new(Store::default()));
    Router::new()
        .route("/json", get(json_document))
        .route("/text", get(text_document))
        .route("/echo", any(echo))
        .route("/status/{code}", any(status))
        .route("/delay/{ms}", get(delay))
        .route("/items", get(list_items).post(create_item))
        .route("/ws", get(ws_echo))
        .with_state(db)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn json_document() -> Json<Value> {
    Json(serde_json::json!({ "x": 1 }))
}

async fn text_document() -> &'static str {
    "hello"
}

async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> Json<Echo> {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    Json(Echo {
        method: method.as_str().to_string(),
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn status(Path(code): Path<u16>) -> (StatusCode, String) {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    (status, format!("status {}", status.as_u16()))
}

async fn delay(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "done"
}

async fn list_items(State(db): State<Db>) -> Json<Vec<Item>> {
    Json(db.read().await.items.clone())
}

async fn create_item(State(db): State<Db>, Json(value): Json<Value>) -> (StatusCode, Json<Item>) {
    let mut store = db.write().await;
    let item = Item {
        id: store.next_id,
        value,
    };
    store.next_id += 1;
    store.items.push(item.clone());
    (StatusCode::CREATED, Json(item))
}

async fn ws_echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(echo_socket)
}

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}
