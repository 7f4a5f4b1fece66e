use runtime::{Duration, Instant};

use crate::{MemoryTimingModel, occupy};

/// A naive memory timing model that assumes a fixed throughput and latency.
pub struct NaiveTiming {
    tck: Duration,
    latency: Duration,
    xfer: Duration,
    cmd: Vec<Instant>,
    data: Vec<Instant>,
}

impl NaiveTiming {
    /// Create a new naive DDR timing model with given clock frequency, CAS delay, and bus width (in bits).
    pub fn new(tck: Duration, cas: u32, bus_width: u32, num_channel: u32) -> Self {
        let xfer_cycle = 64 * 8 / bus_width / 2;
        Self {
            tck,
            latency: tck * cas,
            xfer: tck * xfer_cycle,
            cmd: vec![Instant::INIT; num_channel as usize],
            data: vec![Instant::INIT; num_channel as usize],
        }
    }

    pub fn preset_ddr4_2400p(num_channel: u32) -> Self {
        Self::new(Duration::from_picos(833), 16, 64, num_channel)
    }
}

impl MemoryTimingModel for NaiveTiming {
    fn read(&mut self, now: Instant, _addr: u64) -> Instant {
        // Send the command, then wait for CAS delay.
        let issued = occupy(&mut self.cmd, now, self.tck);
        occupy(&mut self.data, issued + self.latency, self.xfer)
    }

    fn write(&mut self, now: Instant, _addr: u64) -> Instant {
        let issued = occupy(&mut self.cmd, now, self.tck);
        occupy(&mut self.data, issued, self.xfer)
    }
}
