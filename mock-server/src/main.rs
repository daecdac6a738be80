use tokio::net::TcpListener;

/// Serves the test routes (`/json`, `/text`, `/echo`, `/status/{code}`,
/// `/delay/{ms}`, `/items`, `/ws`) on `127.0.0.1:$PORT`.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    println!("mock server listening on {}", listener.local_addr()?);
    mock_server::run(listener).await
}
