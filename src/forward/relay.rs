//! Per-connection relay between an accepted socket and its channel

use super::ForwardError;
use crate::channel::{DirectChannel, Endpoint};
use crate::session::Multiplexer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// Everything a relay needs from its listener
#[derive(Clone)]
pub(crate) struct RelayContext {
    pub(crate) mux: Arc<Multiplexer>,
    pub(crate) remote: Endpoint,
    /// Bound listener address, reported as originator
    pub(crate) local: Endpoint,
    pub(crate) open_timeout: Duration,
    /// How long a graceful close may wait for the peer's CLOSE
    pub(crate) close_timeout: Duration,
    pub(crate) buffer_size: usize,
}

/// Relay one accepted connection until either side finishes.
///
/// Failures stay inside this task.
pub(crate) async fn run(context: RelayContext, socket: TcpStream, peer: SocketAddr) {
    let channel = match context
        .mux
        .create_direct_channel(context.remote.clone(), context.local.clone())
    {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Relay for {}: cannot create channel: {}", peer, e);
            return;
        }
    };

    let (mut read_half, write_half) = socket.into_split();
    if let Err(e) = relay(&context, &channel, &mut read_half, write_half).await {
        warn!(
            "Relay {} -> {} on channel {} failed: {}",
            peer,
            context.remote,
            channel.id(),
            e
        );

        // The channel owns the socket's write half and shuts it down on close
        let close = channel.close(true).await;
        if let Some(cleanup) = close.error() {
            debug!("Relay for {}: channel cleanup failed: {}", peer, cleanup);
        }
        drop(read_half);
    }
}

async fn relay(
    context: &RelayContext,
    channel: &DirectChannel,
    read_half: &mut OwnedReadHalf,
    write_half: OwnedWriteHalf,
) -> Result<(), ForwardError> {
    channel.set_forward_target(write_half)?;
    let open = channel.open().await?;
    open.wait_for(context.open_timeout).await;
    if let Some(e) = open.error() {
        return Err(ForwardError::OpenFailed(e));
    }
    if !open.is_done() {
        return Err(ForwardError::OpenIncomplete(context.open_timeout));
    }

    debug!(
        "Relaying {} -> {} over channel {}",
        context.local,
        context.remote,
        channel.id()
    );

    let closed = channel.close_future();
    let mut buf = vec![0u8; context.buffer_size];
    loop {
        let n = tokio::select! {
            read = read_half.read(&mut buf) => read?,
            _ = closed.wait() => {
                debug!("Channel {} closed by peer, relay done", channel.id());
                return Ok(());
            }
        };
        if n == 0 {
            break;
        }
        trace!("Relay: {} bytes into channel {}", n, channel.id());
        channel.write(&buf[..n]).await?;
    }

    debug!("Client finished, closing channel {}", channel.id());
    let close = channel.close(false).await;
    // Keep the channel routable until the peer answers, within bounds
    close.wait_timeout(context.close_timeout).await;
    if !close.is_done() {
        debug!(
            "Peer did not answer close of channel {} within {:?}, closing now",
            channel.id(),
            context.close_timeout
        );
        channel.close(true).await;
    }
    Ok(())
}
