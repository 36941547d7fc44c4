// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The dkimsignd server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::config::ListenAddress;
use crate::protocol::{self, Attributes};
use crate::server::config::Config;
use crate::server::handlers::{self, ServerState};
use crate::server::keystore::KeyStore;
use crate::server::options::TagMaps;

/// A dkimsignd server: the immutable request state plus the bound socket.
///
/// The socket is bound synchronously in [`Server::new`] so that the daemon
/// harness can bind a privileged endpoint, then chroot and drop root,
/// before the async runtime exists.
pub struct Server {
    state: Arc<ServerState>,
    listener: BoundListener,
}

enum BoundListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

/// A running server. Dropping the [`CancellationToken`] side stops the
/// accept loop; existing connections drain before the task finishes.
pub struct Listener {
    local_addr: Option<SocketAddr>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    halt_token: CancellationToken,
}

impl Listener {
    /// The bound TCP address. Primarily useful for tests binding port 0;
    /// [`None`] for Unix-socket listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get a cancellation token which can be used to start the graceful
    /// shutdown of this listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }

    /// Stop accepting new connections and wait for existing connections to
    /// complete.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }
}

impl Server {
    /// Build the key store and tag maps from `config` and bind the
    /// listening socket.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let mut keystore = KeyStore::new();
        for key in &config.keys {
            keystore.declare(&key.domain, &key.selector, &key.file, key.record.clone())?;
        }
        keystore.postprocess()?;
        tracing::info!(
            keys = config.keys.len(),
            sender_maps = config.sender_maps.len(),
            "signing key store ready"
        );
        let tag_maps = TagMaps::compile(&config.sender_maps);

        let listener = match &config.listen {
            ListenAddress::Inet(address) => {
                let listener = std::net::TcpListener::bind(address)
                    .with_context(|| format!("failed to bind {address}"))?;
                listener.set_nonblocking(true)?;
                BoundListener::Tcp(listener)
            }
            ListenAddress::Unix(path) => {
                // A previous instance may have left its socket behind.
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => {
                        return Err(error)
                            .with_context(|| format!("failed to remove stale {}", path.display()));
                    }
                }
                let listener = std::os::unix::net::UnixListener::bind(path)
                    .with_context(|| format!("failed to bind {}", path.display()))?;
                listener.set_nonblocking(true)?;
                BoundListener::Unix(listener)
            }
        };

        Ok(Self {
            state: Arc::new(ServerState {
                keystore: Arc::new(keystore),
                tag_maps,
            }),
            listener,
        })
    }

    /// Run the server.
    #[instrument(skip_all, name = "server")]
    pub fn run(self) -> Listener {
        let halt_token = CancellationToken::new();
        let server_halt_token = halt_token.clone();
        let local_addr = match &self.listener {
            BoundListener::Tcp(listener) => listener.local_addr().ok(),
            BoundListener::Unix(_) => None,
        };

        let task = tokio::spawn(async move {
            let connections = TaskTracker::new();
            match self.listener {
                BoundListener::Tcp(listener) => {
                    let listener = tokio::net::TcpListener::from_std(listener)?;
                    tracing::info!(address = ?listener.local_addr()?, "accepting connections");
                    loop {
                        tokio::select! {
                            _ = server_halt_token.cancelled() => break,
                            accepted = listener.accept() => match accepted {
                                Ok((stream, peer)) => {
                                    let span = tracing::info_span!("connection", %peer);
                                    connections.spawn(
                                        handle(self.state.clone(), stream, server_halt_token.clone())
                                            .instrument(span),
                                    );
                                }
                                Err(error) => {
                                    tracing::warn!(?error, "failed to accept incoming connection");
                                }
                            },
                        }
                    }
                }
                BoundListener::Unix(listener) => {
                    let listener = tokio::net::UnixListener::from_std(listener)?;
                    tracing::info!("accepting connections on the Unix socket");
                    loop {
                        tokio::select! {
                            _ = server_halt_token.cancelled() => break,
                            accepted = listener.accept() => match accepted {
                                Ok((stream, _peer)) => {
                                    let span = tracing::info_span!("connection");
                                    connections.spawn(
                                        handle(self.state.clone(), stream, server_halt_token.clone())
                                            .instrument(span),
                                    );
                                }
                                Err(error) => {
                                    tracing::warn!(?error, "failed to accept incoming connection");
                                }
                            },
                        }
                    }
                }
            }

            tracing::info!("shutdown requested, no new connections will be accepted");
            connections.close();
            connections.wait().await;

            Ok::<_, anyhow::Error>(())
        });

        Listener {
            local_addr,
            task,
            halt_token,
        }
    }
}

/// Serve one connection: accumulate attribute lines, dispatch on every
/// blank line, and write the response before reading on. Malformed lines
/// are skipped; any I/O failure drops the connection.
#[instrument(skip_all, err)]
async fn handle<S>(
    state: Arc<ServerState>,
    stream: S,
    halt_token: CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut attributes = Attributes::new();

    loop {
        let line = tokio::select! {
            _ = halt_token.cancelled() => {
                tracing::debug!("shutdown requested; closing connection");
                break;
            }
            line = lines.next_line() => line.context("read from peer")?,
        };
        let Some(line) = line else {
            tracing::debug!("peer closed the connection");
            break;
        };

        if line.is_empty() {
            if attributes.is_empty() {
                tracing::trace!("ignoring stray blank line");
                continue;
            }
            let response = handlers::dispatch(&state, &attributes).await;
            attributes.clear();
            writer
                .write_all(response.encode().as_bytes())
                .await
                .context("write response")?;
            writer.flush().await.context("flush response")?;
            continue;
        }

        match protocol::decode_line(&line) {
            Ok((name, value)) => attributes.push(name, value),
            Err(error) => tracing::warn!(%error, "skipping malformed request line"),
        }
    }

    Ok(())
}
