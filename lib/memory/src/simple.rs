use runtime::{Duration, Instant};

use crate::row_buffer::RowBuffer;
use crate::{MemoryTimingModel, occupy};

/// A very simple memory timing model focused on primary timing only.
///
/// Currently refresh is ignored.
pub struct SimpleTiming {
    tck: Duration,
    latency: Duration,
    xfer: Duration,
    cmd: Vec<Instant>,
    data: Vec<Instant>,
    row_width: u32,
    bank_width: u32,
    banks: Vec<RowBuffer>,
}

impl SimpleTiming {
    /// Create a new simple DDR timing model with given clock frequency, CAS/RCD/RP delays, and bus width (in bits).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tck: Duration,
        cas: u32,
        rcd: u32,
        rp: u32,
        bus_width: u32,
        row_width: u32,
        bank_width: u32,
        num_channel: u32,
    ) -> Self {
        let xfer_cycle = 64 * 8 / bus_width / 2;
        let num_channel = num_channel as usize;
        Self {
            tck,
            latency: tck * cas,
            xfer: tck * xfer_cycle,
            cmd: vec![Instant::INIT; num_channel],
            data: vec![Instant::INIT; num_channel],
            row_width,
            bank_width,
            banks: (0..(1 << bank_width))
                .map(|_| RowBuffer::new(tck, rcd, rp))
                .collect(),
        }
    }

    pub fn preset_ddr4_2400p(num_channel: u32) -> Self {
        let channel_width = num_channel.ilog2();
        Self::new(
            Duration::from_picos(833),
            16,
            16,
            16,
            64,
            // 8GBx8
            // For now, for channel simulation, map it to banks..
            16 - channel_width,
            4 + channel_width,
            num_channel,
        )
    }

    fn locate(&self, addr: u64) -> (usize, u32) {
        let bank_id = ((addr >> 6) & ((1 << self.bank_width) - 1)) as usize;
        let row_id = ((addr >> (10 + self.bank_width)) & ((1 << self.row_width) - 1)) as u32;
        (bank_id, row_id)
    }
}

impl MemoryTimingModel for SimpleTiming {
    fn read(&mut self, now: Instant, addr: u64) -> Instant {
        let issued = occupy(&mut self.cmd, now, self.tck);

        let (bank_id, row_id) = self.locate(addr);
        let bank = &mut self.banks[bank_id];
        let open = bank.acquire(issued, row_id);

        // Wait for CAS delay.
        let column_done = open + self.latency;
        bank.release(column_done);

        occupy(&mut self.data, column_done, self.xfer)
    }

    fn write(&mut self, now: Instant, addr: u64) -> Instant {
        let issued = occupy(&mut self.cmd, now, self.tck);

        let (bank_id, row_id) = self.locate(addr);
        let open = self.banks[bank_id].acquire(issued, row_id);

        // Send the data
        let done = occupy(&mut self.data, open, self.xfer);
        self.banks[bank_id].release(done);
        done
    }
}
