//! Wire-byte counters — bytes actually crossing the socket, after any
//! per-message compression. Distinct from the application counters on
//! [`crate::Session`], which count pre-compression frame lengths.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared between the transport wrapper (which increments) and
/// observers (which read). Installed before the HTTP upgrade so the
/// upgrade's own bytes are counted.
#[derive(Debug, Default)]
pub struct WireMeter {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl WireMeter {
    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let meter = WireMeter::default();
        meter.add_read(10);
        meter.add_read(5);
        meter.add_written(7);
        assert_eq!(meter.bytes_read(), 15);
        assert_eq!(meter.bytes_written(), 7);
    }
}
