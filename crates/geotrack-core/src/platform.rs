//! # Platform Collaborators
//!
//! Narrow contracts for what the operating system provides: background
//! execution leases and a connectivity signal.
//!
//! ```text
//! ┌───────────────────────┐        ┌───────────────────────┐
//! │   BackgroundLease     │        │  ConnectivityProbe    │
//! │   acquire() → handle  │        │  is_available()       │
//! │   release(handle)     │        │  on_change(callback)  │
//! └──────────┬────────────┘        └──────────┬────────────┘
//!            │ LeaseGuard (RAII)              │ bool signal
//!            ▼                                ▼
//!   tracking start, sync attempt        Sync Agent triggers
//! ```
//!
//! [`LeaseGuard`] releases its handle exactly once, on drop, so every exit
//! path (success, `?`, cancellation of the owning future) is covered.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

// =============================================================================
// Background Lease
// =============================================================================

/// Opaque handle returned by [`BackgroundLease::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseHandle(pub u64);

/// Grants background execution time.
pub trait BackgroundLease: Send + Sync {
    fn acquire(&self) -> LeaseHandle;
    fn release(&self, handle: LeaseHandle);
}

/// Holds a lease for its lifetime.
pub struct LeaseGuard {
    lease: Arc<dyn BackgroundLease>,
    handle: LeaseHandle,
}

impl LeaseGuard {
    pub fn acquire(lease: &Arc<dyn BackgroundLease>) -> Self {
        let handle = lease.acquire();
        trace!(handle = handle.0, "Background lease acquired");
        LeaseGuard {
            lease: Arc::clone(lease),
            handle,
        }
    }

    pub fn handle(&self) -> LeaseHandle {
        self.handle
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        trace!(handle = self.handle.0, "Background lease released");
        self.lease.release(self.handle);
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard").field("handle", &self.handle).finish()
    }
}

/// Lease for environments without suspension; counts outstanding handles.
#[derive(Debug, Default)]
pub struct NoopLease {
    next: AtomicU64,
    outstanding: AtomicU64,
}

impl NoopLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles acquired but not yet released.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl BackgroundLease for NoopLease {
    fn acquire(&self) -> LeaseHandle {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        LeaseHandle(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn release(&self, _handle: LeaseHandle) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Connectivity
// =============================================================================

/// Callback invoked with the new availability.
pub type ConnectivityCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Reduced connectivity signal.
pub trait ConnectivityProbe: Send + Sync {
    fn is_available(&self) -> bool;
    fn on_change(&self, callback: ConnectivityCallback);
}

/// Connectivity driven by the host (or tests) through [`set`](Self::set).
#[derive(Default)]
pub struct ManualConnectivity {
    available: AtomicBool,
    callbacks: Mutex<Vec<Arc<dyn Fn(bool) + Send + Sync>>>,
}

impl ManualConnectivity {
    pub fn new(available: bool) -> Self {
        ManualConnectivity {
            available: AtomicBool::new(available),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Updates the signal; callbacks fire only on an actual change.
    pub fn set(&self, available: bool) {
        let previous = self.available.swap(available, Ordering::SeqCst);
        if previous == available {
            return;
        }
        let callbacks: Vec<_> = self
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for callback in callbacks {
            callback(available);
        }
    }
}

impl ConnectivityProbe for ManualConnectivity {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn on_change(&self, callback: ConnectivityCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::from(callback));
    }
}

impl fmt::Debug for ManualConnectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualConnectivity")
            .field("available", &self.is_available())
            .finish()
    }
}
