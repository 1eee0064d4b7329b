//! TCP transport: newline-delimited JSON, credentials on the first line.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ClientEvent, ServerEvent};
use super::session::LocationGateway;
use super::GatewayError;
use crate::channel::Connector;

const ERROR_BACKOFF: Duration = Duration::from_millis(150);

type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;

pub struct GatewayListener<K: Connector> {
    listener: TcpListener,
    gateway: Arc<LocationGateway<K>>,
}

impl<K: Connector> GatewayListener<K> {
    pub async fn bind(addr: &str, gateway: Arc<LocationGateway<K>>) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener, gateway })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires; each runs in its own task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), GatewayError> {
        info!(addr = ?self.listener.local_addr().ok(), "gateway listener active");
        let mut last_error = None::<io::ErrorKind>;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    last_error = None;
                    let gateway = Arc::clone(&self.gateway);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(gateway, stream, shutdown).await {
                            debug!(%peer, error = %err, "connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    let kind = err.kind();
                    if last_error != Some(kind) {
                        warn!(error = %err, "gateway accept error");
                    }
                    last_error = Some(kind);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
        info!("gateway listener stopped");
        Ok(())
    }
}

enum Inbound {
    Line(String),
    Closed,
    Shutdown,
}

/// Next complete line. `Ok(None)` at end of stream; an over-long line is a
/// protocol violation.
async fn next_line(lines: &mut LineReader) -> Result<Option<String>, GatewayError> {
    match lines.next().await {
        None => Ok(None),
        Some(Ok(line)) => Ok(Some(line)),
        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
            Err(GatewayError::Protocol("line too long".to_string()))
        }
        Some(Err(LinesCodecError::Io(err))) => Err(GatewayError::Io(err)),
    }
}

async fn serve_connection<K: Connector>(
    gateway: Arc<LocationGateway<K>>,
    stream: TcpStream,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(gateway.settings().max_line_bytes),
    );

    let Some(token) = read_credentials(&gateway, &mut lines, &mut write_half).await? else {
        return Ok(());
    };
    let (session, mut outbound) = match gateway.open_session(&token) {
        Ok(opened) => opened,
        Err(err) => {
            write_event(&mut write_half, &ServerEvent::error("authentication failed")).await?;
            return Err(err);
        }
    };

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            if let Err(err) = write_event(&mut write_half, &event).await {
                debug!(error = %err, "session write failed");
                break;
            }
        }
    });

    let result = loop {
        let inbound = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Inbound::Shutdown,
            line = next_line(&mut lines) => match line {
                Ok(Some(line)) => Inbound::Line(line),
                Ok(None) => Inbound::Closed,
                Err(err @ GatewayError::Protocol(_)) => {
                    warn!(session_id = session.id, error = %err, "closing session");
                    session.send(ServerEvent::error(err.to_string()));
                    break Err(err);
                }
                Err(err) => break Err(err),
            },
        };
        let line = match inbound {
            Inbound::Line(line) => line,
            Inbound::Closed | Inbound::Shutdown => break Ok(()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let handled = match ClientEvent::parse(&line) {
            Ok(event) => gateway.handle_event(&session, event).await,
            Err(err) => Err(err),
        };
        if let Err(err) = handled {
            warn!(session_id = session.id, error = %err, "client event failed");
            session.send(ServerEvent::error(err.to_string()));
        }
    };

    gateway.close_session(&session);
    drop(session);
    if writer.await.is_err() {
        debug!("session writer task aborted");
    }
    result
}

/// Read the `authenticate` line. `None` when the peer hung up first.
async fn read_credentials<K: Connector>(
    gateway: &LocationGateway<K>,
    lines: &mut LineReader,
    writer: &mut OwnedWriteHalf,
) -> Result<Option<String>, GatewayError> {
    let first = match tokio::time::timeout(gateway.settings().auth_timeout, next_line(lines)).await {
        Ok(Err(err @ GatewayError::Protocol(_))) => {
            write_event(writer, &ServerEvent::error(err.to_string())).await?;
            return Err(err);
        }
        Ok(line) => line?,
        Err(_) => {
            write_event(writer, &ServerEvent::error("authentication timed out")).await?;
            return Err(GatewayError::Unauthenticated);
        }
    };
    let Some(first) = first else {
        return Ok(None);
    };

    match ClientEvent::parse(&first) {
        Ok(ClientEvent::Authenticate(credentials)) => Ok(Some(credentials.token)),
        Ok(_) => {
            write_event(writer, &ServerEvent::error("authenticate first")).await?;
            Err(GatewayError::Unauthenticated)
        }
        Err(err) => {
            write_event(writer, &ServerEvent::error(err.to_string())).await?;
            Err(err)
        }
    }
}

async fn write_event(writer: &mut OwnedWriteHalf, event: &ServerEvent) -> Result<(), GatewayError> {
    let mut line = event
        .to_line()
        .map_err(|err| GatewayError::Protocol(err.to_string()))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
