use runtime::{Duration, Instant};

/// Row buffer of a single bank.
///
/// Requests are served in arrival order. A request to the currently open row skips activation; any other row
/// pays precharge (if a row is open) plus activation.
pub struct RowBuffer {
    precharge: Duration,
    rcd: Duration,
    open_row: Option<u32>,
    busy_until: Instant,
}

impl RowBuffer {
    pub fn new(tck: Duration, rcd: u32, rp: u32) -> Self {
        Self {
            precharge: tck * rp,
            rcd: tck * rcd,
            open_row: None,
            busy_until: Instant::INIT,
        }
    }

    /// Simulate row activation, returning the instant the row is open for column access.
    pub fn acquire(&mut self, at: Instant, row: u32) -> Instant {
        let start = self.busy_until.max(at);
        let ready = match self.open_row {
            Some(open) if open == row => start,
            Some(_) => start + self.precharge + self.rcd,
            None => start + self.rcd,
        };
        self.open_row = Some(row);
        self.busy_until = ready;
        ready
    }

    /// Hold the bank until the column access finishes.
    pub fn release(&mut self, at: Instant) {
        self.busy_until = self.busy_until.max(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_skips_activation() {
        let tck = Duration::from_nanos(1);
        let mut bank = RowBuffer::new(tck, 10, 12);

        let t = bank.acquire(Instant::INIT, 3);
        assert_eq!(t, Instant::INIT + tck * 10u32);
        bank.release(t);

        assert_eq!(bank.acquire(t, 3), t);
        assert_eq!(bank.acquire(t, 4), t + tck * 22u32);
    }
}
