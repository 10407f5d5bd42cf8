use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::{debug, warn};

use crate::{
    error::UpdaterError,
    transport::{Connection, Transport},
};

/// Which connection slot a guard protects. Each phase has its own lock and its
/// own handle, so cancelling one never waits on the other.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Version check requests
    Request,
    /// Firmware image downloads
    Download,
    /// Firmware image uploads
    Upload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Request => "request",
            Self::Download => "download",
            Self::Upload => "upload",
        })
    }
}

/// Holds the connection of one phase behind a mutex. The worker opens a
/// connection through [`Self::open`] and performs its blocking call on the
/// returned [`Lease`] without holding the lock, so [`Self::cancel`] can always
/// acquire the lock and interrupt the call from another thread.
pub struct ConnectionGuard<C> {
    phase: Phase,
    /// Latch shared with the owning orchestrator
    cancelled: Arc<AtomicBool>,
    slot: Mutex<Option<Arc<C>>>,
}

impl<C: Connection> ConnectionGuard<C> {
    pub fn new(phase: Phase, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            phase,
            cancelled,
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Arc<C>>>, UpdaterError> {
        self.slot.lock()
            .map_err(|_| UpdaterError::SystemResource(format!("{} lock is poisoned", self.phase)))
    }

    /// Whether a connection is currently stored in the slot.
    pub fn is_open(&self) -> bool {
        self.slot.lock().map_or(false, |s| s.is_some())
    }

    /// Open a connection to `host` and store it in the slot. The latch is read
    /// under the lock, so a cancel request that took the lock first is never
    /// missed: the open fails with [`UpdaterError::Cancelled`] instead.
    pub fn open<T>(
        &self,
        transport: &T,
        host: &str,
        port: u16,
        secure: bool,
    ) -> Result<Lease<'_, C>, UpdaterError>
    where
        T: Transport<Connection = C>,
    {
        let mut slot = self.lock()?;

        if self.cancelled.load(Ordering::SeqCst) {
            debug!("Not opening {} connection: cancelled", self.phase);
            return Err(UpdaterError::Cancelled);
        }

        if let Some(stale) = slot.take() {
            warn!("Replacing {} connection that was never released", self.phase);
            if let Err(e) = stale.cancel() {
                warn!("Could not cancel stale {} connection: {}", self.phase, e);
            }
        }

        debug!("Opening {} connection to {}:{}", self.phase, host, port);
        let connection = Arc::new(transport.connect(host, port, secure)?);
        *slot = Some(connection.clone());

        Ok(Lease {
            guard: self,
            connection,
            released: false,
        })
    }

    /// Cancel and release the stored connection, if any. Any call in flight on
    /// it returns a cancellation error. Calling this with an empty slot, or
    /// twice, is a no-op.
    pub fn cancel(&self) -> Result<(), UpdaterError> {
        let mut slot = self.lock()?;

        if let Some(connection) = slot.take() {
            debug!("Cancelling {} connection", self.phase);
            if let Err(e) = connection.cancel() {
                warn!("Could not cancel {} connection: {}", self.phase, e);
            }
        }

        Ok(())
    }

    /// Tear down `connection` if it is still the one in the slot. A concurrent
    /// [`Self::cancel`] may already have released it.
    fn release(&self, connection: &Arc<C>) -> Result<(), UpdaterError> {
        let mut slot = self.lock()?;

        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, connection) => {
                slot.take();
                debug!("Closing {} connection", self.phase);
                connection.cancel()?;
            }
            _ => debug!("{} connection was already released", self.phase),
        }

        Ok(())
    }
}

/// Exclusive use of the connection opened by [`ConnectionGuard::open`]. The
/// connection is closed by [`Self::close`], or on drop for error paths.
pub struct Lease<'a, C: Connection> {
    guard: &'a ConnectionGuard<C>,
    connection: Arc<C>,
    released: bool,
}

impl<C: Connection> fmt::Debug for Lease<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("phase", &self.guard.phase)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Lease<'_, C> {
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Close the connection, reporting teardown failures.
    pub fn close(mut self) -> Result<(), UpdaterError> {
        self.released = true;
        self.guard.release(&self.connection)
    }
}

impl<C: Connection> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.guard.release(&self.connection) {
                warn!("Could not close {} connection: {}", self.guard.phase, e);
            }
        }
    }
}
