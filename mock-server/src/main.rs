use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let name = std::env::var("SERVER_NAME").unwrap_or_else(|_| "tiles".to_string());
    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("listening on {addr} as {name}");
    mock_server::run_with_state(listener, mock_server::AppState::new(&name)).await
}
