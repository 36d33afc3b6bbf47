//! Opening byte streams to the server.
//!
//! Streams come from the configured [`TransportFactory`] when there is one,
//! otherwise from a Unix socket or TCP. SSL is negotiated here so the
//! engine only ever sees a ready duplex stream.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::config::{BoxStream, PoolOptions, SslMode};
use super::error::{PgError, PgResult};
use super::protocol::{CancelRequestMessage, FrontendMessage, SslRequestMessage};
use super::query::BackendKey;

/// Open a stream to the host at `host_index` and negotiate SSL.
pub(crate) async fn open(options: &PoolOptions, host_index: usize) -> PgResult<BoxStream> {
    let (host, port) = target(options, host_index);
    let stream = match options.transport {
        Some(ref factory) => factory.connect(&host, port).await?,
        None => connect_socket(options, &host, port).await?,
    };
    negotiate_ssl(options, stream, &host).await
}

fn target(options: &PoolOptions, host_index: usize) -> (String, u16) {
    let hosts = &options.settings.hosts;
    if hosts.is_empty() {
        return ("localhost".to_string(), 5432);
    }
    hosts[host_index % hosts.len()].clone()
}

async fn connect_socket(options: &PoolOptions, host: &str, port: u16) -> io::Result<BoxStream> {
    if let Some(ref path) = options.settings.path {
        return connect_unix(path, port).await;
    }
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;
    Ok(Box::new(tcp))
}

#[cfg(unix)]
async fn connect_unix(path: &str, port: u16) -> io::Result<BoxStream> {
    // A directory means the server's default socket name inside it.
    let socket = if path.contains(".s.PGSQL.") {
        path.to_string()
    } else {
        format!("{}/.s.PGSQL.{}", path.trim_end_matches('/'), port)
    };
    let stream = tokio::net::UnixStream::connect(socket).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn connect_unix(_path: &str, _port: u16) -> io::Result<BoxStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets are not available on this platform",
    ))
}

async fn negotiate_ssl(options: &PoolOptions, mut stream: BoxStream, host: &str) -> PgResult<BoxStream> {
    let mode = options.settings.ssl;
    let tls = match (mode, options.tls.as_ref()) {
        (SslMode::Disable, _) | (SslMode::Prefer, None) => return Ok(stream),
        (SslMode::Require, None) => {
            return Err(PgError::Protocol(
                "sslmode=require needs a TLS upgrader".to_string(),
            ))
        }
        (_, Some(tls)) => tls,
    };

    stream.write_all(&SslRequestMessage.to_bytes()).await?;
    stream.flush().await?;
    let mut reply = [0u8; 1];
    stream.read_exact(&mut reply).await?;

    match reply[0] {
        b'S' => {
            tracing::debug!(host, "upgrading connection to TLS");
            Ok(tls.upgrade(stream, host).await?)
        }
        b'N' if mode == SslMode::Prefer => Ok(stream),
        b'N' => Err(PgError::Protocol(
            "server does not support TLS (SSLRequest rejected)".to_string(),
        )),
        other => Err(PgError::Protocol(format!(
            "Unexpected SSLRequest reply: {:?}",
            other as char
        ))),
    }
}

/// Ask the server to cancel whatever `key`'s backend is running.
///
/// Uses its own short-lived connection; the server answers by closing it.
pub(crate) async fn cancel(options: &PoolOptions, host_index: usize, key: BackendKey) -> PgResult<()> {
    let mut stream = open(options, host_index).await?;
    let frame = CancelRequestMessage {
        process_id: key.process_id,
        secret_key: key.secret_key,
    }
    .to_bytes();
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut sink = [0u8; 64];
    while stream.read(&mut sink).await? > 0 {}
    Ok(())
}
