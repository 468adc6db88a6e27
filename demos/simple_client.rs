use std::net::SocketAddr;
use std::str::FromStr;

use tracing::Level;

use bercon::connection::config::ConnectionConfig;
use bercon::connection::ConnectionDetails;
use bercon::socket::{RconSocket, SocketConfig};


fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    init_logging();

    let mut args = std::env::args().skip(1);
    let remote = args.next().unwrap_or_else(|| "127.0.0.1:2302".to_string());
    let password = args.next().unwrap_or_else(|| "password".to_string());
    let command = args.next().unwrap_or_else(|| "players".to_string());

    let (socket, _socket_events) = RconSocket::bind(SocketConfig { port: 0, ..Default::default() }).await?;
    let recv_socket = socket.clone();
    tokio::spawn(async move { recv_socket.recv_loop().await });

    let details = ConnectionDetails {
        remote: SocketAddr::from_str(&remote)?,
        password,
    };
    let (connection, mut events) = socket.connection(details, ConnectionConfig::default(), false).await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("event: {:?}", event);
        }
    });

    connection.connect().await?;
    let response = connection.command(&command).await?;
    println!("{}", response.data.unwrap_or_default());

    connection.disconnect().await;
    socket.shutdown().await;
    Ok(())
}
