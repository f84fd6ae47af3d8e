//! TCP acceptor for the line protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sprout_config::ServerConfig;
use sprout_messaging::MessagingService;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::session::{run_session, SessionSettings};

const BUSY_REPLY: &[u8] = b"ERROR Server busy\n";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct MessagingServer {
    listener: TcpListener,
    service: Arc<MessagingService>,
    settings: SessionSettings,
    sessions: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl MessagingServer {
    /// Bind the configured address. Port 0 picks a free port.
    pub async fn bind(
        config: &ServerConfig,
        service: Arc<MessagingService>,
        shutdown: CancellationToken,
    ) -> GatewayResult<Self> {
        let address: SocketAddr = format!("{}:{}", config.address, config.port)
            .parse()
            .map_err(|_| {
                GatewayError::InvalidAddress(format!("{}:{}", config.address, config.port))
            })?;

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| GatewayError::bind(address, source))?;

        Ok(Self {
            listener,
            service,
            settings: SessionSettings::from(config),
            sessions: Arc::new(Semaphore::new(config.max_sessions.max(1))),
            shutdown,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> GatewayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown token fires, then wait for every
    /// session to finish.
    pub async fn run(self) -> GatewayResult<()> {
        let local_addr = self.local_addr()?;
        info!(%local_addr, "messaging server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        warn!(%error, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let permit = match Arc::clone(&self.sessions).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(%peer, "session limit reached, rejecting connection");
                    self.tracker.spawn(reject_busy(stream));
                    continue;
                }
            };

            debug!(%peer, "accepted connection");
            let service = Arc::clone(&self.service);
            let settings = self.settings;
            let shutdown = self.shutdown.clone();
            self.tracker.spawn(async move {
                run_session(stream, service, settings, shutdown).await;
                drop(permit);
            });
        }

        info!("messaging server stopping, waiting for sessions");
        drop(self.listener);
        self.tracker.close();
        self.tracker.wait().await;
        info!("messaging server stopped");
        Ok(())
    }
}

async fn reject_busy(mut stream: TcpStream) {
    if let Err(error) = stream.write_all(BUSY_REPLY).await {
        debug!(%error, "failed to send busy reply");
        return;
    }
    if let Err(error) = stream.shutdown().await {
        debug!(%error, "failed to close rejected connection");
    }
}
