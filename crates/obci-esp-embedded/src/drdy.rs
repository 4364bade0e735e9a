//! Data-ready flag shared between the DRDY edge handler and the main loop
//!
//! The ADS1299 pulls DRDY low when a conversion is available. The edge
//! handler only raises this flag; the acquisition routine clears it before
//! touching the bus so an edge that lands mid-read is not lost.
//!
//! ```
//! use obci_esp_embedded::DataReady;
//!
//! static DRDY: DataReady = DataReady::new();
//!
//! // edge handler
//! DRDY.signal();
//!
//! // main loop
//! assert!(DRDY.is_set());
//! DRDY.clear();
//! assert!(!DRDY.is_set());
//! ```

use core::sync::atomic::{AtomicBool, Ordering};

/// Single-writer / single-clearer atomic flag.
#[derive(Debug, Default)]
pub struct DataReady {
    ready: AtomicBool,
}

impl DataReady {
    /// Create a cleared flag. Usable in a `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self { ready: AtomicBool::new(false) }
    }

    /// Raise the flag. Safe to call from interrupt context.
    #[inline]
    pub fn signal(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// Whether a conversion is waiting.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Lower the flag.
    #[inline]
    pub fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Lower the flag and report whether it was raised.
    #[inline]
    pub fn take(&self) -> bool {
        self.ready.swap(false, Ordering::AcqRel)
    }
}
