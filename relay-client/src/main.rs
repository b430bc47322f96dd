use relay_client::config::ClientConfig;
use relay_client::{RelayStream, WebSocketEndpoint};
use relay_proto::{MAX_DATA_PAYLOAD, MIN_READ_SIZE};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!("Relay forwarder v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let url = Url::parse(&config.relay.url)?;

    let listen = format!(
        "{}:{}",
        config.forward.listen_addr, config.forward.listen_port
    );
    let listener = TcpListener::bind(&listen).await?;
    info!("Listening on {}, relaying to {}", listen, url);

    loop {
        let (socket, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        info!("Connection from {}", remote_addr);

        let endpoint = match &config.relay.bearer_token {
            Some(token) => WebSocketEndpoint::with_bearer_token(url.clone(), token.clone()),
            None => WebSocketEndpoint::new(url.clone()),
        };
        let connect_timeout = Duration::from_secs(config.timeouts.connect_timeout_secs);

        tokio::spawn(async move {
            if let Err(e) = forward(socket, endpoint, connect_timeout).await {
                warn!("Forwarding for {} ended: {}", remote_addr, e);
            }
        });
    }
}

/// Pumps bytes between one accepted TCP connection and one relay stream.
async fn forward(
    socket: TcpStream,
    endpoint: WebSocketEndpoint,
    connect_timeout: Duration,
) -> anyhow::Result<()> {
    let stream = Arc::new(RelayStream::new(endpoint));
    let cancel = CancellationToken::new();

    match tokio::time::timeout(connect_timeout, stream.open(&cancel)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => anyhow::bail!("relay connection timeout"),
    }

    let (mut tcp_rd, mut tcp_wr) = socket.into_split();

    let upstream = {
        let stream = Arc::clone(&stream);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATA_PAYLOAD];
            loop {
                let n = tcp_rd.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stream.write(&buf[..n], &cancel).await?;
            }
            stream.close(&cancel).await?;
            anyhow::Ok(())
        })
    };

    let downstream = {
        let stream = Arc::clone(&stream);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MIN_READ_SIZE];
            loop {
                let n = stream.read(&mut buf, &cancel).await?;
                if n == 0 {
                    break;
                }
                tcp_wr.write_all(&buf[..n]).await?;
            }
            tcp_wr.shutdown().await?;
            anyhow::Ok(())
        })
    };

    // Whichever direction finishes first tears the other one down.
    let result = tokio::select! {
        r = upstream => r,
        r = downstream => r,
    };
    cancel.cancel();
    result??;

    Ok(())
}

fn load_config() -> anyhow::Result<ClientConfig> {
    // Try configs/relay.toml (development)
    if let Ok(config) = ClientConfig::from_file("configs/relay.toml") {
        info!("Loaded config from configs/relay.toml");
        return Ok(config);
    }

    // Try ./relay.toml (current directory)
    if let Ok(config) = ClientConfig::from_file("relay.toml") {
        info!("Loaded config from relay.toml");
        return Ok(config);
    }

    warn!("No config file found, using default configuration");
    Ok(ClientConfig::default_config())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
