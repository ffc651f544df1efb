/// Connects to a WebSocket server and prints the negotiated subprotocol.
///
/// ```text
/// cargo run --example client --features logging -- wss://echo.websocket.org chat
/// ```
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use wsdial::{ClientConfig, Connector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug)?;

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());
    let subprotocols: Vec<String> = args.collect();

    let config = ClientConfig::default()
        .with_timeout(Duration::from_secs(10))
        .with_handshake_timeout(Duration::from_secs(10))
        .with_subprotocols(subprotocols)
        .with_env_proxy();

    let mut conn = Connector::new(config).connect(&url).await?;
    log::info!("connected, subprotocol: {:?}", conn.subprotocol());

    // masked text frame "hello"
    let mask = [0x12, 0x34, 0x56, 0x78];
    let mut frame = vec![0x81, 0x80 | 5];
    frame.extend_from_slice(&mask);
    frame.extend(b"hello".iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m));
    conn.write_all(&frame).await?;

    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf)).await??;
    log::info!("received {n} bytes: {:02x?}", &buf[..n]);

    // masked close frame
    conn.write_all(&[0x88, 0x80, 0, 0, 0, 0]).await?;
    conn.close().await?;

    Ok(())
}
