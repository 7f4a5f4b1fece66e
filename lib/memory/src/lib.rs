mod naive;
mod row_buffer;
mod simple;
pub mod testutils;
mod transport;

use runtime::{Duration, Instant};

pub use naive::NaiveTiming;
pub use simple::SimpleTiming;
pub use transport::{Backpressure, Command, Packet, Response, Transport, TransportStats};

/// Size of the unit every model reads and writes.
pub const LINE_SIZE: u64 = 64;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
}

pub trait MemoryTimingModel {
    /// Read 64-bytes of memory issued at `now`, returning the instant the data is back.
    ///
    /// We fix to 64-bytes to accomodate memory emulators.
    fn read(&mut self, now: Instant, addr: u64) -> Instant;

    /// Write 64-bytes of memory issued at `now`, returning the instant the write is done.
    fn write(&mut self, now: Instant, addr: u64) -> Instant;
}

pub trait MemoryModel {
    /// Read 64-bytes of memory.
    fn read(&mut self, addr: u64) -> [u8; 64];

    /// Write 64-bytes of memory.
    fn write(&mut self, addr: u64, bytes: [u8; 64]);
}

/// A simulated memory that is backed by host memory.
pub struct MemoryBacked {
    data: Vec<[u8; 64]>,
}

impl MemoryBacked {
    pub fn with_capacity(size: usize) -> Self {
        assert!(size.is_multiple_of(LINE_SIZE as usize));
        Self {
            data: vec![[0; 64]; size / LINE_SIZE as usize],
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * LINE_SIZE as usize
    }

    pub fn with_data<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        use zerocopy::IntoBytes;

        f(self.data.as_mut_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        use zerocopy::IntoBytes;

        IntoBytes::as_bytes(self.data.as_slice())
    }

    fn line(&self, addr: u64) -> usize {
        let line = (addr / LINE_SIZE) as usize;
        assert!(line < self.data.len(), "address {addr:#x} out of bounds");
        line
    }
}

impl MemoryModel for MemoryBacked {
    fn read(&mut self, addr: u64) -> [u8; 64] {
        self.data[self.line(addr)]
    }

    fn write(&mut self, addr: u64, bytes: [u8; 64]) {
        let line = self.line(addr);
        self.data[line] = bytes;
    }
}

// Memory model with utilization statistics
pub struct WithStats<T> {
    model: T,
    statistics: Statistics,
}

impl<T> WithStats<T> {
    pub fn new(model: T) -> Self {
        WithStats {
            model,
            statistics: Statistics::default(),
        }
    }

    pub fn model(&self) -> &T {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut T {
        &mut self.model
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics
    }
}

impl<T: MemoryModel> MemoryModel for WithStats<T> {
    fn read(&mut self, addr: u64) -> [u8; 64] {
        self.statistics.total_bytes_read += LINE_SIZE;
        self.model.read(addr)
    }

    fn write(&mut self, addr: u64, bytes: [u8; 64]) {
        self.statistics.total_bytes_written += LINE_SIZE;
        self.model.write(addr, bytes)
    }
}

/// Occupy the earliest available of a set of identical resources for `hold`, starting no earlier than `at`.
///
/// Returns the instant the resource is released.
pub(crate) fn occupy(slots: &mut [Instant], at: Instant, hold: Duration) -> Instant {
    let slot = slots
        .iter_mut()
        .min()
        .expect("resource pool must not be empty");
    let start = (*slot).max(at);
    *slot = start + hold;
    *slot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backed_round_trip() {
        let mut mem = WithStats::new(MemoryBacked::with_capacity(4096));
        mem.model_mut().with_data(|bytes| bytes[128..132].copy_from_slice(&7u32.to_le_bytes()));

        let mut line = mem.read(128);
        assert_eq!(u32::from_le_bytes(line[..4].try_into().unwrap()), 7);

        line[4] = 1;
        mem.write(128 + 4, line);
        assert_eq!(mem.model().as_bytes()[132], 1);
        assert_eq!(
            mem.statistics(),
            Statistics {
                total_bytes_read: 64,
                total_bytes_written: 64
            }
        );
    }

    #[test]
    #[should_panic]
    fn backed_out_of_bounds() {
        MemoryBacked::with_capacity(64).read(64);
    }

    #[test]
    fn occupy_picks_earliest() {
        let t = Duration::from_nanos(1);
        let mut slots = [Instant::INIT; 2];
        assert_eq!(occupy(&mut slots, Instant::INIT, t * 4u32), Instant::INIT + t * 4u32);
        assert_eq!(occupy(&mut slots, Instant::INIT, t * 4u32), Instant::INIT + t * 4u32);
        // Both busy; the third waits for the first release.
        assert_eq!(occupy(&mut slots, Instant::INIT, t), Instant::INIT + t * 5u32);
    }
}
