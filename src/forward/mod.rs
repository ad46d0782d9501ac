//! Local port forwarding
//!
//! A [`ForwardingListener`] accepts TCP connections on a local address and
//! relays each one through its own direct-tcpip channel to a fixed remote
//! target. Every accepted connection gets an independent relay task; there
//! is no limit on how many run at once.

mod relay;

use crate::channel::{ChannelError, Endpoint};
use crate::config::ForwardConfig;
use crate::session::Multiplexer;
use relay::RelayContext;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Forwarding errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Channel open failed: {0}")]
    OpenFailed(Arc<ChannelError>),

    #[error("Channel open not yet complete after {0:?}")]
    OpenIncomplete(Duration),

    #[error("Listener already running")]
    AlreadyRunning,
}

/// Default relay read buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default channel open timeout
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default bound on waiting for the peer to answer a graceful close
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Local listener forwarding connections to a remote target
pub struct ForwardingListener {
    mux: Arc<Multiplexer>,
    listen: SocketAddr,
    remote: Endpoint,
    open_timeout: Duration,
    close_timeout: Duration,
    buffer_size: usize,
    local_addr: Option<SocketAddr>,
    stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    accept_task: Option<JoinHandle<()>>,
}

impl ForwardingListener {
    /// Create a listener forwarding `listen` to `remote`
    pub fn new(mux: Arc<Multiplexer>, listen: SocketAddr, remote: Endpoint) -> Self {
        Self {
            mux,
            listen,
            remote,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            local_addr: None,
            stop: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            accept_task: None,
        }
    }

    /// Create a listener from a `[[forward]]` entry
    pub fn from_config(mux: Arc<Multiplexer>, config: &ForwardConfig) -> crate::Result<Self> {
        Ok(Self::new(mux, config.listen_addr()?, config.target_endpoint()?)
            .with_open_timeout(config.open_timeout())
            .with_buffer_size(config.buffer_size))
    }

    /// Set the channel open timeout; zero waits indefinitely
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set how long a relay waits for the peer to confirm a graceful close
    /// before closing immediately
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the relay read buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Remote target of every relay
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// Actual bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Check if the accept loop is running
    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Bind the listening socket and start accepting.
    ///
    /// Returns the bound address, which relays report as originator.
    pub async fn start(&mut self) -> Result<SocketAddr, ForwardError> {
        if self.accept_task.is_some() {
            return Err(ForwardError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|source| ForwardError::Bind {
                addr: self.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!("Forwarding {} -> {}", local_addr, self.remote);

        let context = RelayContext {
            mux: Arc::clone(&self.mux),
            remote: self.remote.clone(),
            local: Endpoint::from(local_addr),
            open_timeout: self.open_timeout,
            close_timeout: self.close_timeout,
            buffer_size: self.buffer_size,
        };

        self.stop = Arc::new(AtomicBool::new(false));
        self.shutdown = Arc::new(Notify::new());
        self.local_addr = Some(local_addr);
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            context,
            Arc::clone(&self.stop),
            Arc::clone(&self.shutdown),
        )));

        Ok(local_addr)
    }

    /// Stop accepting and release the listening socket.
    ///
    /// Relays already running are left to finish on their own.
    pub async fn close(&mut self) {
        let Some(task) = self.accept_task.take() else {
            return;
        };

        self.stop.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
        if let Err(e) = task.await {
            warn!("Accept loop for {:?} ended abnormally: {}", self.local_addr, e);
        }
    }
}

impl Drop for ForwardingListener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            self.stop.store(true, Ordering::SeqCst);
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: RelayContext,
    stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let local = context.local.clone();

    while !stop.load(Ordering::SeqCst) {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!("Accepted {} on {}", peer, local);
                    socket.set_nodelay(true).ok();
                    tokio::spawn(relay::run(context.clone(), socket, peer));
                }
                Err(e) => {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("Accept failed on {}: {}", local, e);
                    // Back off so descriptor exhaustion does not spin
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    info!("Forwarding listener on {} stopped", local);
}
