use std::fmt;

use memory::{Statistics, TransportStats};
use serde::Serialize;

use crate::indirect::State;
use crate::instruction::Opcode;

/// Cycles an indirect access unit spent in each stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageCycles {
    pub decode: u64,
    pub fill: u64,
    pub drain: u64,
    pub build: u64,
    pub request: u64,
    pub response: u64,
}

impl StageCycles {
    pub fn add(&mut self, state: State, cycles: u64) {
        match state {
            State::Idle => {}
            State::Decode => self.decode += cycles,
            State::Fill => self.fill += cycles,
            State::Drain => self.drain += cycles,
            State::Build => self.build += cycles,
            State::Request => self.request += cycles,
            State::Response => self.response += cycles,
        }
    }

    pub fn total(&self) -> u64 {
        self.decode + self.fill + self.drain + self.build + self.request + self.response
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndirectStats {
    pub loads: u64,
    pub stores: u64,
    pub rmws: u64,
    /// Elements that went through the row table.
    pub words_inserted: u64,
    /// Distinct cache lines among them, per instruction.
    pub lines_inserted: u64,
    /// Distinct row-table rows, per instruction.
    pub rows_inserted: u64,
    /// Elements skipped by a false predicate.
    pub predicated_off: u64,
    /// Times the row table was full during fill.
    pub drains: u64,
    /// Instructions that ran with a different row-table layout than the one before.
    pub layout_switches: u64,
    pub requests: u64,
    pub responses: u64,
    pub write_backs: u64,
    pub evictions: u64,
    pub send_rejections: u64,
    pub unique_words: u64,
    pub unique_lines: u64,
    pub unique_rows: u64,
    pub cycles: StageCycles,
}

impl IndirectStats {
    pub fn count_instruction(&mut self, opcode: Opcode) {
        match opcode {
            Opcode::INDIR_LD => self.loads += 1,
            Opcode::INDIR_ST => self.stores += 1,
            Opcode::INDIR_RMW => self.rmws += 1,
            other => panic!("{other:?} is not an indirect access"),
        }
    }

    pub fn instructions(&self) -> u64 {
        self.loads + self.stores + self.rmws
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportReport {
    pub reads: u64,
    pub writes: u64,
    pub cache_hits: u64,
    pub evictions: u64,
    pub rejected: u64,
    pub peak_in_flight: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl TransportReport {
    pub fn new(transport: TransportStats, memory: Statistics) -> Self {
        Self {
            reads: transport.reads,
            writes: transport.writes,
            cache_hits: transport.cache_hits,
            evictions: transport.evictions,
            rejected: transport.rejected,
            peak_in_flight: transport.peak_in_flight,
            bytes_read: memory.total_bytes_read,
            bytes_written: memory.total_bytes_written,
        }
    }
}

/// Everything reported at the end of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub simulated_ns: f64,
    pub instructions_finished: u64,
    pub tiles_invalidated: u64,
    pub indirect: Vec<IndirectStats>,
    pub transport: TransportReport,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Simulated time: {:.3} ns", self.simulated_ns)?;
        writeln!(f, "Instructions finished: {}", self.instructions_finished)?;
        writeln!(f, "Tiles invalidated: {}", self.tiles_invalidated)?;
        for (i, s) in self.indirect.iter().enumerate() {
            writeln!(
                f,
                "I[{i}]: {} instructions ({} LD, {} ST, {} RMW), {} words -> {} lines -> {} rows, {} drains, {} layout switches",
                s.instructions(),
                s.loads,
                s.stores,
                s.rmws,
                s.words_inserted,
                s.lines_inserted,
                s.rows_inserted,
                s.drains,
                s.layout_switches
            )?;
            writeln!(
                f,
                "I[{i}]: {} requests, {} responses, {} write-backs, {} evictions, {} rejected sends",
                s.requests, s.responses, s.write_backs, s.evictions, s.send_rejections
            )?;
            let c = &s.cycles;
            writeln!(
                f,
                "I[{i}]: cycles decode {} fill {} drain {} build {} request {} response {} (total {})",
                c.decode,
                c.fill,
                c.drain,
                c.build,
                c.request,
                c.response,
                c.total()
            )?;
        }
        let t = &self.transport;
        write!(
            f,
            "Memory: {} reads ({} cache hits), {} writes, {} bytes read, {} bytes written, peak {} in flight, {} rejected",
            t.reads, t.cache_hits, t.writes, t.bytes_read, t.bytes_written, t.peak_in_flight, t.rejected
        )
    }
}
