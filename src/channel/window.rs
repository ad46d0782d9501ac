//! Flow control window
//!
//! One window per direction per channel. The credit counter is only ever
//! changed through [`Window::consume_and_check`], [`Window::take`] and
//! [`Window::expand`], all of which are single atomic read-modify-write
//! operations, so inbound delivery and replenishment may race freely.

use super::ChannelError;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Notify;
use tracing::trace;

/// Byte credit for one direction of a channel
#[derive(Debug)]
pub struct Window {
    /// "local" or "remote", for logs
    name: &'static str,
    /// Remaining credit
    size: AtomicU32,
    /// Size the window is replenished back to
    max_size: AtomicU32,
    /// Largest payload allowed in one data message
    packet_size: AtomicU32,
    /// Woken on expand and close
    changed: Notify,
    closed: AtomicBool,
}

impl Window {
    /// Create a window with the given credit and packet size
    pub fn new(name: &'static str, size: u32, packet_size: u32) -> Self {
        Self {
            name,
            size: AtomicU32::new(size),
            max_size: AtomicU32::new(size),
            packet_size: AtomicU32::new(packet_size),
            changed: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Reset credit and packet size, e.g. from the peer's open confirmation
    pub fn init(&self, size: u32, packet_size: u32) {
        self.max_size.store(size, Ordering::SeqCst);
        self.packet_size.store(packet_size, Ordering::SeqCst);
        self.size.store(size, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Remaining credit
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    /// Size the window was initialised with
    pub fn max_size(&self) -> u32 {
        self.max_size.load(Ordering::SeqCst)
    }

    /// Maximum payload per data message
    pub fn packet_size(&self) -> u32 {
        self.packet_size.load(Ordering::SeqCst)
    }

    /// Atomically subtract `len` if enough credit is left.
    ///
    /// On failure the window is left untouched.
    pub fn consume_and_check(&self, len: u32) -> Result<(), ChannelError> {
        self.size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                size.checked_sub(len)
            })
            .map(|_| ())
            .map_err(|available| ChannelError::WindowExceeded {
                requested: len,
                available,
            })
    }

    /// Take up to `wanted` bytes of credit (bounded by the packet size) without waiting
    pub fn take(&self, wanted: u32) -> Option<u32> {
        let limit = wanted.min(self.packet_size());
        if limit == 0 {
            return None;
        }

        let mut taken = 0;
        self.size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                taken = size.min(limit);
                if taken == 0 {
                    None
                } else {
                    Some(size - taken)
                }
            })
            .ok()
            .map(|_| taken)
    }

    /// Wait until some credit is available and take up to `wanted` bytes of it.
    ///
    /// Returns [`ChannelError::Closed`] once the window is closed.
    pub async fn wait_for_space(&self, wanted: u32) -> Result<u32, ChannelError> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.is_closed() {
                return Err(ChannelError::Closed);
            }
            if let Some(taken) = self.take(wanted) {
                return Ok(taken);
            }

            trace!("{} window exhausted, waiting for credit", self.name);
            changed.await;
        }
    }

    /// Add credit and wake blocked writers
    pub fn expand(&self, increment: u32) {
        let _ = self
            .size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                Some(size.saturating_add(increment))
            });
        trace!("{} window expanded by {}", self.name, increment);
        self.changed.notify_waiters();
    }

    /// Amount to add back once the window dropped below half its maximum
    pub fn replenish_amount(&self) -> Option<u32> {
        let max = self.max_size();
        let size = self.size();
        if size < max / 2 {
            Some(max - size)
        } else {
            None
        }
    }

    /// Fail current and future waiters
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Check if the window has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
