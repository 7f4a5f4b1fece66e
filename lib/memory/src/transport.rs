//! The shared memory-side port of the accelerator.
//!
//! Every requestor (an accelerator lane) sends line-sized packets through one [`Transport`]. The transport only
//! holds a fixed number of packets in flight; a send beyond that fails with [`Backpressure`] and the requestor
//! is remembered so it can be woken, in first-come-first-served order, once a slot frees up.
//!
//! An upstream cache is modelled only as the set of lines it currently holds. Reads of such lines are served at
//! cache latency and flagged in the [`Response`] so that the requestor may evict them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::trace;
use runtime::{Duration, Instant};

use crate::{LINE_SIZE, MemoryBacked, MemoryModel, MemoryTimingModel, Statistics, WithStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Read a line without the intent to modify it.
    ReadShared,
    /// Read a line that the requestor is going to write back.
    ReadExclusive,
    /// Write a full line.
    WriteBack,
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub requestor: usize,
    pub cmd: Command,
    pub addr: u64,
    pub data: [u8; 64],
}

impl Packet {
    pub fn read(requestor: usize, addr: u64, exclusive: bool) -> Self {
        Self {
            requestor,
            cmd: if exclusive {
                Command::ReadExclusive
            } else {
                Command::ReadShared
            },
            addr,
            data: [0; 64],
        }
    }

    pub fn write_back(requestor: usize, addr: u64, data: [u8; 64]) -> Self {
        Self {
            requestor,
            cmd: Command::WriteBack,
            addr,
            data,
        }
    }
}

/// Data returned for a completed read.
#[derive(Debug, Clone)]
pub struct Response {
    pub requestor: usize,
    pub addr: u64,
    pub data: [u8; 64],
    /// The line was held by the upstream cache when the read was served.
    pub was_cached: bool,
}

/// The transport is at capacity; retry once woken through [`Transport::take_unblocked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backpressure;

impl std::fmt::Display for Backpressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "memory transport is at capacity")
    }
}

impl std::error::Error for Backpressure {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub reads: u64,
    pub writes: u64,
    pub cache_hits: u64,
    pub evictions: u64,
    pub rejected: u64,
    pub peak_in_flight: usize,
}

struct InFlight {
    packet: Packet,
    was_cached: bool,
}

pub struct Transport {
    timing: Box<dyn MemoryTimingModel>,
    memory: WithStats<MemoryBacked>,
    capacity: usize,
    cache_hit_latency: Duration,
    seq: u64,
    in_flight: BTreeMap<(Instant, u64), InFlight>,
    blocked: VecDeque<usize>,
    cached: BTreeSet<u64>,
    stats: TransportStats,
}

impl Transport {
    pub fn new(
        timing: Box<dyn MemoryTimingModel>,
        memory: MemoryBacked,
        capacity: usize,
        cache_hit_latency: Duration,
    ) -> Self {
        assert!(capacity > 0);
        Self {
            timing,
            memory: WithStats::new(memory),
            capacity,
            cache_hit_latency,
            seq: 0,
            in_flight: BTreeMap::new(),
            blocked: VecDeque::new(),
            cached: BTreeSet::new(),
            stats: TransportStats::default(),
        }
    }

    /// Try to send a packet.
    ///
    /// On success, returns the instant the packet completes; the caller should call [`Transport::complete`] at
    /// (or after) that instant.
    pub fn send(&mut self, now: Instant, packet: Packet) -> Result<Instant, Backpressure> {
        assert!(packet.addr.is_multiple_of(LINE_SIZE), "unaligned packet {:#x}", packet.addr);

        if self.in_flight.len() >= self.capacity {
            if !self.blocked.contains(&packet.requestor) {
                self.blocked.push_back(packet.requestor);
            }
            self.stats.rejected += 1;
            return Err(Backpressure);
        }

        let mut was_cached = false;
        let done = match packet.cmd {
            Command::ReadShared | Command::ReadExclusive => {
                self.stats.reads += 1;
                if self.cached.contains(&packet.addr) {
                    self.stats.cache_hits += 1;
                    was_cached = true;
                    now + self.cache_hit_latency
                } else {
                    self.timing.read(now, packet.addr)
                }
            }
            Command::WriteBack => {
                self.stats.writes += 1;
                self.timing.write(now, packet.addr)
            }
        };

        trace!(
            "transport: {:?} {:#x} from {} done at {:?}",
            packet.cmd, packet.addr, packet.requestor, done
        );
        self.in_flight.insert((done, self.seq), InFlight { packet, was_cached });
        self.seq += 1;
        self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.in_flight.len());
        Ok(done)
    }

    /// Retire every packet completing at or before `now`.
    ///
    /// Writes are applied to memory; reads sample memory now, so a write retired earlier is visible.
    pub fn complete(&mut self, now: Instant) -> Vec<Response> {
        let mut responses = Vec::new();
        while let Some(entry) = self.in_flight.first_entry()
            && entry.key().0 <= now
        {
            let InFlight { packet, was_cached } = entry.remove();
            match packet.cmd {
                Command::WriteBack => self.memory.write(packet.addr, packet.data),
                Command::ReadShared | Command::ReadExclusive => responses.push(Response {
                    requestor: packet.requestor,
                    addr: packet.addr,
                    data: self.memory.read(packet.addr),
                    was_cached,
                }),
            }
        }
        responses
    }

    /// Requestors that were refused and may now retry, oldest first.
    ///
    /// At most as many requestors as there are free slots are returned.
    pub fn take_unblocked(&mut self) -> Vec<usize> {
        let free = self.capacity - self.in_flight.len();
        let n = free.min(self.blocked.len());
        self.blocked.drain(..n).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Mark a line as held by the upstream cache.
    pub fn cache(&mut self, addr: u64) {
        self.cached.insert(addr - addr % LINE_SIZE);
    }

    pub fn is_cached(&self, addr: u64) -> bool {
        self.cached.contains(&(addr - addr % LINE_SIZE))
    }

    /// Drop a line from the upstream cache.
    pub fn evict(&mut self, addr: u64) {
        if self.cached.remove(&(addr - addr % LINE_SIZE)) {
            self.stats.evictions += 1;
        }
    }

    pub fn memory(&self) -> &MemoryBacked {
        self.memory.model()
    }

    pub fn memory_mut(&mut self) -> &mut MemoryBacked {
        self.memory.model_mut()
    }

    pub fn memory_statistics(&self) -> Statistics {
        self.memory.statistics()
    }

    pub fn statistics(&self) -> TransportStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NaiveTiming;

    fn transport(capacity: usize) -> Transport {
        Transport::new(
            Box::new(NaiveTiming::new(Duration::from_nanos(1), 16, 64, 1)),
            MemoryBacked::with_capacity(4096),
            capacity,
            Duration::from_nanos(2),
        )
    }

    #[test]
    fn backpressure_is_fcfs() {
        let mut t = transport(1);
        let done = t.send(Instant::INIT, Packet::read(0, 0, false)).unwrap();
        assert_eq!(t.send(Instant::INIT, Packet::read(2, 64, false)), Err(Backpressure));
        assert_eq!(t.send(Instant::INIT, Packet::read(1, 128, false)), Err(Backpressure));
        assert_eq!(t.send(Instant::INIT, Packet::read(2, 64, false)), Err(Backpressure));
        assert!(t.take_unblocked().is_empty());

        let responses = t.complete(done);
        assert_eq!(responses.len(), 1);
        assert_eq!(t.take_unblocked(), [2]);
        assert_eq!(t.statistics().rejected, 3);
    }

    #[test]
    fn write_then_read() {
        let mut t = transport(4);
        let mut line = [0; 64];
        line[3] = 9;
        let w = t.send(Instant::INIT, Packet::write_back(0, 192, line)).unwrap();
        assert!(t.complete(w).is_empty());

        let r = t.send(w, Packet::read(0, 192, true)).unwrap();
        let responses = t.complete(r);
        assert_eq!(responses[0].data[3], 9);
        assert!(!responses[0].was_cached);
        assert_eq!(t.memory_statistics().total_bytes_written, 64);
    }

    #[test]
    fn cached_lines_are_flagged() {
        let mut t = transport(4);
        t.cache(64 + 8);
        assert!(t.is_cached(64));

        let r = t.send(Instant::INIT, Packet::read(0, 64, false)).unwrap();
        assert_eq!(r, Instant::INIT + Duration::from_nanos(2));
        let responses = t.complete(r);
        assert!(responses[0].was_cached);

        t.evict(64);
        assert!(!t.is_cached(64));
        assert_eq!(t.statistics().evictions, 1);
    }
}
