//! Indirect access unit.
//!
//! Executes `INDIR_LD`, `INDIR_ST` and `INDIR_RMW`. The index tile is walked in iteration order; every element
//! address is coalesced into the row table of its bank, so that each distinct cache line is requested exactly
//! once and requests to the same DRAM row are issued back to back. Responses are fanned out to every waiting
//! iteration through the offset table.

use std::collections::{HashSet, VecDeque};

use log::{debug, trace};
use memory::{Backpressure, Packet, Transport};
use runtime::{Duration, Instant};
use scratchpad::Scratchpad;

use crate::addr_map::AddrMapper;
use crate::instruction::{FuncUnit, Instruction, Opcode};
use crate::layout::{self, Layout, LayoutCache};
use crate::load_config::AcceleratorConfig;
use crate::offset_table::OffsetTable;
use crate::row_table::RowTable;
use crate::scoreboard::InstrId;
use crate::stats::IndirectStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Decode,
    Fill,
    Drain,
    Build,
    Request,
    Response,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub num_tile_elements: usize,
    pub num_rows: usize,
    pub entries_per_row: usize,
    /// Cycles per batch of row table accesses.
    pub row_table_latency: u32,
    pub row_table_parallelism: usize,
    pub period: Duration,
    pub physical_offset: u64,
    pub reconfigure: bool,
    pub layout_cache_entries: usize,
}

impl From<&AcceleratorConfig> for EngineConfig {
    fn from(config: &AcceleratorConfig) -> Self {
        Self {
            num_tile_elements: config.config.num_tile_elements.value,
            num_rows: config.config.num_row_table_rows.value,
            entries_per_row: config.config.num_row_table_entries_per_row.value,
            row_table_latency: config.latency.row_table.value,
            row_table_parallelism: config.latency.row_table_parallelism.value,
            period: Duration::from_picos(config.config.clock_period_ps.value),
            physical_offset: config.config.physical_offset.value,
            reconfigure: config.config.reconfigure_row_table(),
            layout_cache_entries: config.config.num_row_table_config_cache_entries.value,
        }
    }
}

/// Shared state a unit works on during one call.
pub struct Ctx<'a> {
    pub now: Instant,
    pub spd: &'a mut Scratchpad,
    pub mem: &'a mut Transport,
    /// Completion instants of the packets sent during this call.
    pub sent: Vec<Instant>,
}

impl<'a> Ctx<'a> {
    pub fn new(now: Instant, spd: &'a mut Scratchpad, mem: &'a mut Transport) -> Self {
        Self {
            now,
            spd,
            mem,
            sent: Vec::new(),
        }
    }
}

/// Why [`IndirectAccessUnit::execute`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Idle,
    /// Busy until the given instant; execute again then.
    Rearm(Instant),
    /// An element of the tile is not produced yet; execute again once the tile is written.
    WaitTile(u8),
    /// Waiting for responses or for the transport to accept a send.
    WaitMemory,
    Finished(InstrId),
    /// Element `iteration` addresses `addr`, outside of memory. The unit stops there.
    OutOfRange { iteration: usize, addr: u64 },
}

/// Answer to a memory response offered to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    NotMine,
    /// The response was consumed; `wake` asks for the unit to be executed.
    Mine { wake: bool },
}

enum Step {
    Continue,
    Yield(Outcome),
}

enum FillExit {
    Done,
    Full { table: usize },
    Wait(u8),
    OutOfRange(u64),
}

#[derive(Debug, Clone, Copy)]
struct Current {
    id: InstrId,
    instr: Instruction,
    idx: u8,
    cond: Option<u8>,
    src: Option<u8>,
    dst: Option<u8>,
    width: usize,
}

pub struct IndirectAccessUnit {
    id: usize,
    cfg: EngineConfig,
    mapper: AddrMapper,
    layouts: Vec<Layout>,
    /// Layout of the current (or last) instruction.
    layout: usize,
    layout_cache: LayoutCache,
    ot: OffsetTable,

    state: State,
    current: Option<Current>,
    /// Next iteration to fill.
    itr: usize,
    /// Iteration at which the row tables last ran full.
    drained_at: Option<usize>,
    /// Table that ran full.
    full: Option<usize>,
    /// Stage that follows `Request`.
    after_request: State,
    pending_reads: VecDeque<u64>,
    pending_writes: VecDeque<(u64, [u8; 64])>,
    expected: u64,
    received: u64,
    busy_until: Instant,
    stage_start: Instant,

    words: HashSet<u64>,
    lines: HashSet<u64>,
    rows: HashSet<(usize, u64)>,
    stats: IndirectStats,
}

impl IndirectAccessUnit {
    pub fn new(id: usize, cfg: EngineConfig, mapper: AddrMapper) -> Self {
        let layouts = layout::layouts(&mapper, cfg.num_rows, cfg.entries_per_row, cfg.reconfigure);
        let layout_cache = LayoutCache::new(cfg.layout_cache_entries, &layouts, cfg.reconfigure);
        Self {
            id,
            layouts,
            layout: 0,
            layout_cache,
            ot: OffsetTable::new(cfg.num_tile_elements),
            cfg,
            mapper,
            state: State::Idle,
            current: None,
            itr: 0,
            drained_at: None,
            full: None,
            after_request: State::Response,
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
            expected: 0,
            received: 0,
            busy_until: Instant::INIT,
            stage_start: Instant::INIT,
            words: HashSet::new(),
            lines: HashSet::new(),
            rows: HashSet::new(),
            stats: IndirectStats::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Instruction being executed, if any.
    pub fn current(&self) -> Option<InstrId> {
        self.current.map(|c| c.id)
    }

    /// Tile written by the current instruction.
    pub fn dst_tile(&self) -> Option<u8> {
        self.current.and_then(|c| c.dst)
    }

    pub fn statistics(&self) -> &IndirectStats {
        &self.stats
    }

    /// Row-table layout of the current instruction, or of the last one when idle.
    pub fn layout(&self) -> usize {
        self.layout
    }

    /// Number of bank tables in each layout, narrowest first.
    pub fn layout_tables(&self) -> Vec<usize> {
        self.layouts.iter().map(|l| l.tables.len()).collect()
    }

    /// No row table, offset table or send holds state.
    pub fn is_quiesced(&self) -> bool {
        self.ot.is_empty()
            && self.layouts.iter().all(Layout::is_empty)
            && self.pending_reads.is_empty()
            && self.pending_writes.is_empty()
    }

    /// Start executing `instr`. The unit must be idle.
    pub fn assign(&mut self, id: InstrId, instr: Instruction, now: Instant) {
        assert!(self.is_idle(), "I[{}]: busy, cannot take {id}", self.id);
        assert_eq!(instr.opcode.unit(), FuncUnit::Indirect, "I[{}]: {instr} is not indirect", self.id);
        let Some(idx) = instr.src1 else {
            panic!("I[{}]: {instr} has no index tile", self.id);
        };
        let (src, dst) = match instr.opcode {
            Opcode::INDIR_LD => (None, instr.dst1),
            _ => (instr.src2, None),
        };
        self.current = Some(Current {
            id,
            instr,
            idx,
            cond: instr.cond,
            src,
            dst,
            width: instr.datatype.width(),
        });
        self.enter(State::Decode, now);
    }

    fn cur(&self) -> Current {
        match self.current {
            Some(c) => c,
            None => panic!("I[{}]: no instruction in {:?}", self.id, self.state),
        }
    }

    fn enter(&mut self, state: State, now: Instant) {
        let at = now.max(self.busy_until);
        let cycles = (at - self.stage_start).in_cycles(self.cfg.period);
        self.stats.cycles.add(self.state, cycles);
        trace!("I[{}]: {:?} -> {:?} at {:?}", self.id, self.state, state, at);
        self.state = state;
        self.stage_start = at;
    }

    /// Hold the unit for `cycles` after `now`.
    fn charge(&mut self, now: Instant, cycles: u32) {
        self.busy_until = self.busy_until.max(now + self.cfg.period * cycles);
    }

    fn row_table_cycles(&self, accesses: usize) -> u32 {
        accesses.div_ceil(self.cfg.row_table_parallelism) as u32 * self.cfg.row_table_latency
    }

    /// Advance as far as possible at `ctx.now`.
    pub fn execute(&mut self, ctx: &mut Ctx) -> Outcome {
        loop {
            if self.state != State::Idle && ctx.now < self.busy_until {
                return Outcome::Rearm(self.busy_until);
            }
            let step = match self.state {
                State::Idle => return Outcome::Idle,
                State::Decode => self.decode(ctx),
                State::Fill => self.fill(ctx),
                State::Drain => self.drain(ctx),
                State::Build => self.build(ctx),
                State::Request => self.request(ctx),
                State::Response => self.response(ctx),
            };
            if let Step::Yield(outcome) = step {
                return outcome;
            }
        }
    }

    fn decode(&mut self, ctx: &mut Ctx) -> Step {
        let cur = self.cur();
        let layout = self.layout_cache.lookup(cur.instr.base_addr, ctx.now);
        if layout != self.layout {
            let next = &self.layouts[layout];
            debug!(
                "I[{}]: switching to row-table layout {layout}, {} tables of {} lines per row",
                self.id,
                next.tables.len(),
                next.entries_per_row
            );
            self.stats.layout_switches += 1;
            self.layout = layout;
        }
        self.ot.check_reset();
        self.layouts[self.layout].tables.iter_mut().for_each(RowTable::reset);
        assert!(
            self.pending_reads.is_empty() && self.pending_writes.is_empty(),
            "I[{}]: stale requests at decode",
            self.id
        );
        self.itr = 0;
        self.drained_at = None;
        self.full = None;
        self.expected = 0;
        self.received = 0;
        self.words.clear();
        self.lines.clear();
        self.rows.clear();
        self.stats.count_instruction(cur.instr.opcode);

        debug!("I[{}]: {} {}", self.id, cur.id, cur.instr);
        self.enter(State::Fill, ctx.now);
        Step::Continue
    }

    /// First operand tile whose element `i` is not produced yet.
    fn missing_operand(spd: &Scratchpad, cur: &Current, i: usize) -> Option<u8> {
        [Some(cur.idx), cur.cond, cur.src]
            .into_iter()
            .flatten()
            .find(|&t| !spd.element_ready(t as usize, i))
    }

    fn fill(&mut self, ctx: &mut Ctx) -> Step {
        let cur = self.cur();
        let idx = cur.idx as usize;
        let mut rt_accesses = 0;
        let mut spd_accesses = 0;

        let exit = loop {
            let i = self.itr;
            if ctx.spd.is_ready(idx) && i >= ctx.spd.size(idx) {
                break FillExit::Done;
            }
            if let Some(tile) = Self::missing_operand(ctx.spd, &cur, i) {
                break FillExit::Wait(tile);
            }

            if let Some(cond) = cur.cond {
                spd_accesses += 1;
                if ctx.spd.read(cond as usize, i) as u32 == 0 {
                    if let Some(dst) = cur.dst {
                        ctx.spd.write(dst as usize, i, 0);
                        spd_accesses += 1;
                    }
                    self.stats.predicated_off += 1;
                    self.itr += 1;
                    continue;
                }
            }

            let index = ctx.spd.read(idx, i) as u32 as u64;
            spd_accesses += 1;
            let addr = cur.instr.base_addr + self.cfg.physical_offset + cur.width as u64 * index;
            if addr + cur.width as u64 > ctx.mem.memory().size_in_bytes() as u64 {
                break FillExit::OutOfRange(addr);
            }
            let block = self.mapper.block_align(addr);
            let wid = ((addr - block) / cur.width as u64) as usize;
            let loc = self.mapper.map(block);
            let layout = &mut self.layouts[self.layout];
            let key = layout.map.row_group_key(&loc);
            let table = layout.map.bank_table(&loc);

            rt_accesses += 1;
            if !layout.tables[table].insert(&mut self.ot, key, block, i, wid) {
                assert_ne!(self.drained_at, Some(i), "I[{}]: double drain at iteration {i}", self.id);
                self.drained_at = Some(i);
                break FillExit::Full { table };
            }
            trace!("I[{}]: E[{i}] idx {index} -> {addr:#x} RT[{table}] key {key:#x}", self.id);
            self.words.insert(addr);
            self.lines.insert(block);
            self.rows.insert((table, key));
            self.itr += 1;
        };

        let cycles = self
            .row_table_cycles(rt_accesses)
            .max(ctx.spd.access_latency(spd_accesses));
        self.charge(ctx.now, cycles);

        match exit {
            FillExit::Done => {
                debug!("I[{}]: filled {} iterations", self.id, self.itr);
                self.enter(State::Build, ctx.now);
                Step::Continue
            }
            FillExit::Full { table } => {
                debug!(
                    "I[{}]: RT[{table}] full at iteration {}, {:.2} lines per row",
                    self.id,
                    self.itr,
                    self.layouts[self.layout].tables[table].average_lines_per_row()
                );
                self.stats.drains += 1;
                self.full = Some(table);
                self.enter(State::Drain, ctx.now);
                Step::Continue
            }
            FillExit::Wait(tile) => {
                trace!("I[{}]: E[{}] waiting on T{tile}", self.id, self.itr);
                Step::Yield(Outcome::WaitTile(tile))
            }
            FillExit::OutOfRange(addr) => {
                debug!("I[{}]: E[{}] address {addr:#x} is outside of memory", self.id, self.itr);
                Step::Yield(Outcome::OutOfRange {
                    iteration: self.itr,
                    addr,
                })
            }
        }
    }

    fn drain(&mut self, ctx: &mut Ctx) -> Step {
        let Some(table) = self.full.take() else {
            panic!("I[{}]: draining without a full row table", self.id);
        };
        let row = self.layouts[self.layout].tables[table].drain_victim();
        let mut lines = 0;
        while let Some(addr) = self.layouts[self.layout].tables[table].send_next_in_row(row) {
            self.queue_read(addr);
            lines += 1;
        }
        assert!(lines > 0, "I[{}]: RT[{table}] row {row} had nothing to drain", self.id);
        debug!("I[{}]: draining {lines} lines of RT[{table}] row {row}", self.id);

        let cycles = self.row_table_cycles(lines);
        self.charge(ctx.now, cycles);
        self.after_request = State::Fill;
        self.flush(ctx);
        self.enter(State::Request, ctx.now);
        Step::Continue
    }

    fn build(&mut self, ctx: &mut Ctx) -> Step {
        let mut lines = 0;
        loop {
            let mut any = false;
            let layout = self.layout;
            for k in 0..self.layouts[layout].order.len() {
                let table = self.layouts[layout].order[k];
                if let Some(addr) = self.layouts[layout].tables[table].send_next() {
                    self.queue_read(addr);
                    lines += 1;
                    any = true;
                }
            }
            if !any {
                break;
            }
        }
        debug!("I[{}]: built {lines} requests", self.id);

        let cycles = self.row_table_cycles(lines);
        self.charge(ctx.now, cycles);
        self.after_request = State::Response;
        self.flush(ctx);
        self.enter(State::Request, ctx.now);
        Step::Continue
    }

    fn request(&mut self, ctx: &mut Ctx) -> Step {
        self.flush(ctx);
        if !self.requests_done() {
            return Step::Yield(Outcome::WaitMemory);
        }
        let next = self.after_request;
        self.enter(next, ctx.now);
        Step::Continue
    }

    fn response(&mut self, ctx: &mut Ctx) -> Step {
        let cur = self.cur();
        assert!(self.requests_done(), "I[{}]: responding with requests outstanding", self.id);
        self.ot.check_reset();
        let layout = &self.layouts[self.layout];
        for table in &layout.tables {
            table.check_reset();
        }
        if let Some(dst) = cur.dst {
            ctx.spd.set_size(dst as usize, self.itr);
        }

        for table in &layout.tables {
            let (words, lines, rows) = table.inserted();
            self.stats.words_inserted += words;
            self.stats.lines_inserted += lines;
            self.stats.rows_inserted += rows;
        }
        self.stats.unique_words += self.words.len() as u64;
        self.stats.unique_lines += self.lines.len() as u64;
        self.stats.unique_rows += self.rows.len() as u64;
        self.layout_cache.update(cur.instr.base_addr, self.rows.len());

        debug!(
            "I[{}]: {} done, {} iterations, {} requests",
            self.id, cur.id, self.itr, self.expected
        );
        self.enter(State::Idle, ctx.now);
        self.current = None;
        Step::Yield(Outcome::Finished(cur.id))
    }

    fn queue_read(&mut self, addr: u64) {
        self.pending_reads.push_back(addr);
        self.expected += 1;
    }

    fn requests_done(&self) -> bool {
        assert!(
            self.received <= self.expected,
            "I[{}]: {} responses for {} requests",
            self.id,
            self.received,
            self.expected
        );
        self.pending_reads.is_empty() && self.pending_writes.is_empty() && self.received == self.expected
    }

    /// Send as many queued packets as the transport accepts.
    fn flush(&mut self, ctx: &mut Ctx) {
        let exclusive = self.cur().instr.opcode != Opcode::INDIR_LD;
        while let Some(&(addr, data)) = self.pending_writes.front() {
            match ctx.mem.send(ctx.now, Packet::write_back(self.id, addr, data)) {
                Ok(done) => {
                    self.pending_writes.pop_front();
                    ctx.sent.push(done);
                    self.stats.write_backs += 1;
                    self.received += 1;
                }
                Err(Backpressure) => {
                    self.stats.send_rejections += 1;
                    return;
                }
            }
        }
        while let Some(&addr) = self.pending_reads.front() {
            match ctx.mem.send(ctx.now, Packet::read(self.id, addr, exclusive)) {
                Ok(done) => {
                    self.pending_reads.pop_front();
                    ctx.sent.push(done);
                    self.stats.requests += 1;
                }
                Err(Backpressure) => {
                    self.stats.send_rejections += 1;
                    return;
                }
            }
        }
    }

    /// The transport has room again. Returns whether the unit should be executed.
    pub fn retry(&mut self, ctx: &mut Ctx) -> bool {
        if self.current.is_none() {
            return false;
        }
        self.flush(ctx);
        self.state == State::Request && self.requests_done()
    }

    /// Offer a read response to this unit.
    pub fn recv_data(&mut self, ctx: &mut Ctx, addr: u64, data: &[u8; 64], was_cached: bool) -> Recv {
        let Some(cur) = self.current else {
            return Recv::NotMine;
        };
        let loc = self.mapper.map(addr);
        let layout = &mut self.layouts[self.layout];
        let table = layout.map.bank_table(&loc);
        let key = layout.map.row_group_key(&loc);
        let waiting = layout.tables[table].recv(&mut self.ot, key, addr);
        if waiting.is_empty() {
            return Recv::NotMine;
        }
        self.stats.responses += 1;
        trace!("I[{}]: {addr:#x} serves {} iterations", self.id, waiting.len());

        if was_cached {
            ctx.mem.evict(addr);
            self.stats.evictions += 1;
        }

        let dt = cur.instr.datatype;
        match (cur.instr.opcode, cur.dst, cur.src) {
            (Opcode::INDIR_LD, Some(dst), _) => {
                for &(itr, wid) in &waiting {
                    ctx.spd.write(dst as usize, itr, dt.load(data, wid));
                }
                self.received += 1;
            }
            (Opcode::INDIR_ST | Opcode::INDIR_RMW, _, Some(src)) => {
                let rmw = cur.instr.opcode == Opcode::INDIR_RMW;
                let mut line = *data;
                for &(itr, wid) in &waiting {
                    let value = ctx.spd.read(src as usize, itr);
                    let value = if rmw { dt.add(dt.load(&line, wid), value) } else { value };
                    dt.store(&mut line, wid, value);
                }
                self.pending_writes.push_back((addr, line));
                self.flush(ctx);
            }
            _ => panic!("I[{}]: cannot serve {}", self.id, cur.instr),
        }

        let cycles = ctx.spd.access_latency(waiting.len());
        self.charge(ctx.now, cycles);
        Recv::Mine {
            wake: self.state == State::Request && self.requests_done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use memory::{MemoryBacked, NaiveTiming};

    use super::*;
    use crate::addr_map::Organization;
    use crate::instruction::DataType;

    const IDX: u8 = 0;
    const COND: u8 = 1;
    const DST: u8 = 2;

    fn config(num_rows: usize, entries_per_row: usize) -> EngineConfig {
        EngineConfig {
            num_tile_elements: 64,
            num_rows,
            entries_per_row,
            row_table_latency: 1,
            row_table_parallelism: 4,
            period: Duration::from_nanos(1),
            physical_offset: 0,
            reconfigure: false,
            layout_cache_entries: 0,
        }
    }

    /// One bank table pair, 16 lines per row.
    fn mapper() -> AddrMapper {
        AddrMapper::new(Organization {
            channels: 1,
            ranks: 1,
            bankgroups: 1,
            banks_per_group: 1,
            rows: 64,
            columns: 16,
        })
    }

    fn setup(capacity: usize) -> (Scratchpad, Transport) {
        let spd = Scratchpad::new(4, 64, 1, 4);
        let mut memory = MemoryBacked::with_capacity(1 << 16);
        memory.with_data(|bytes| {
            for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&(i as u32 * 10).to_le_bytes());
            }
        });
        let mem = Transport::new(
            Box::new(NaiveTiming::new(Duration::from_nanos(1), 16, 64, 1)),
            memory,
            capacity,
            Duration::from_nanos(2),
        );
        (spd, mem)
    }

    fn load_u32(spd: &mut Scratchpad, tile: u8, values: &[u32]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        spd.load_from_bytes(tile as usize, 4, &bytes);
    }

    /// Run one instruction on its own, delivering every response back to the unit.
    fn run(unit: &mut IndirectAccessUnit, spd: &mut Scratchpad, mem: &mut Transport, instr: Instruction) -> Instant {
        if let Some(dst) = instr.dst1 {
            spd.unset_ready(dst as usize);
        }
        let mut now = Instant::INIT;
        let mut in_flight: Vec<Instant> = Vec::new();
        unit.assign(InstrId(0), instr, now);
        loop {
            let mut ctx = Ctx::new(now, spd, mem);
            let outcome = unit.execute(&mut ctx);
            in_flight.extend(ctx.sent);
            match outcome {
                Outcome::Rearm(at) => now = at,
                Outcome::Finished(id) => {
                    assert_eq!(id, InstrId(0));
                    if let Some(dst) = instr.dst1 {
                        spd.set_ready(dst as usize);
                    }
                    // Accepted write-backs land in memory once they complete.
                    if let Some(&last) = in_flight.iter().max() {
                        mem.complete(last);
                    }
                    return now;
                }
                Outcome::WaitMemory => {
                    now = now.max(*in_flight.iter().min().expect("waiting on memory with nothing in flight"));
                    in_flight.retain(|&t| t > now);
                    for r in mem.complete(now) {
                        let mut ctx = Ctx::new(now, spd, mem);
                        let recv = unit.recv_data(&mut ctx, r.addr, &r.data, r.was_cached);
                        assert_ne!(recv, Recv::NotMine, "{:#x} was not requested", r.addr);
                        in_flight.extend(ctx.sent);
                    }
                    for _ in mem.take_unblocked() {
                        let mut ctx = Ctx::new(now, spd, mem);
                        unit.retry(&mut ctx);
                        in_flight.extend(ctx.sent);
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    fn dst_values(spd: &Scratchpad) -> Vec<u32> {
        spd.as_bytes(DST as usize, 4)
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn four_indices_two_lines() {
        let (mut spd, mut mem) = setup(8);
        let mut unit = IndirectAccessUnit::new(0, config(4, 4), mapper());
        load_u32(&mut spd, IDX, &[0, 5, 64, 5]);

        let instr = Instruction::indirect_load(IDX, DST, None, DataType::Uint32, 0);
        run(&mut unit, &mut spd, &mut mem, instr);

        assert_eq!(dst_values(&spd), [0, 50, 640, 50]);
        let stats = unit.statistics();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.responses, 2);
        assert_eq!((stats.words_inserted, stats.lines_inserted, stats.rows_inserted), (4, 2, 1));
        assert_eq!(stats.unique_words, 3);
        assert_eq!(stats.drains, 0);
        assert!(unit.is_idle());
        assert!(unit.is_quiesced());
        assert_eq!(mem.statistics().reads, 2);
    }

    #[test]
    fn false_predicate_writes_zero() {
        let (mut spd, mut mem) = setup(8);
        let mut unit = IndirectAccessUnit::new(0, config(4, 4), mapper());
        load_u32(&mut spd, IDX, &[1, 2, 3, 4]);
        load_u32(&mut spd, COND, &[1, 0, 0, 7]);

        let instr = Instruction::indirect_load(IDX, DST, Some(COND), DataType::Uint32, 0);
        run(&mut unit, &mut spd, &mut mem, instr);

        assert_eq!(dst_values(&spd), [10, 0, 0, 40]);
        assert_eq!(unit.statistics().predicated_off, 2);
        assert_eq!(unit.statistics().requests, 1);
    }

    #[test]
    fn full_table_drains_once() {
        let (mut spd, mut mem) = setup(8);
        // One row of one line per bank table: the second row forces a drain.
        let mut unit = IndirectAccessUnit::new(0, config(1, 1), mapper());
        // Rows are 16 lines of 16 words apart.
        load_u32(&mut spd, IDX, &[3, 256 + 1, 256 + 2]);

        let instr = Instruction::indirect_load(IDX, DST, None, DataType::Uint32, 0);
        run(&mut unit, &mut spd, &mut mem, instr);

        assert_eq!(dst_values(&spd), [30, 2570, 2580]);
        let stats = unit.statistics();
        assert_eq!(stats.drains, 1);
        assert_eq!(stats.requests, 2);
        assert!(stats.cycles.drain > 0);
        assert!(unit.is_quiesced());
    }

    #[test]
    fn rmw_adds_in_place() {
        let (mut spd, mut mem) = setup(1);
        let mut unit = IndirectAccessUnit::new(0, config(4, 4), mapper());
        load_u32(&mut spd, IDX, &[2, 2, 17]);
        load_u32(&mut spd, COND, &[1, 2, 3]);

        let instr = Instruction::indirect_rmw(IDX, COND, None, DataType::Uint32, 0);
        run(&mut unit, &mut spd, &mut mem, instr);

        let word = |i: usize| u32::from_le_bytes(mem.memory().as_bytes()[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(2), 20 + 1 + 2);
        assert_eq!(word(17), 170 + 3);
        assert_eq!(word(3), 30);
        assert_eq!(unit.statistics().write_backs, 2);
        assert!(unit.statistics().send_rejections > 0);
    }

    #[test]
    fn rmw_reads_back_drained_lines() {
        let (mut spd, mut mem) = setup(8);
        let mut unit = IndirectAccessUnit::new(0, config(1, 1), mapper());
        // Alternating between two DRAM rows drains at every switch.
        load_u32(&mut spd, IDX, &[3, 257, 3, 258]);
        load_u32(&mut spd, COND, &[1, 2, 3, 4]);

        let instr = Instruction::indirect_rmw(IDX, COND, None, DataType::Uint32, 0);
        run(&mut unit, &mut spd, &mut mem, instr);

        let word = |i: usize| u32::from_le_bytes(mem.memory().as_bytes()[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(3), 30 + 1 + 3);
        assert_eq!(word(257), 2570 + 2);
        assert_eq!(word(258), 2580 + 4);
        let stats = unit.statistics();
        assert_eq!(stats.drains, 3);
        assert_eq!(stats.requests, 4);
        assert_eq!(stats.write_backs, 4);
        assert!(unit.is_quiesced());
    }

    #[test]
    fn index_past_memory_stops_the_unit() {
        let (mut spd, mut mem) = setup(8);
        let mut unit = IndirectAccessUnit::new(0, config(4, 4), mapper());
        // 1 << 16 bytes hold 1 << 14 words.
        load_u32(&mut spd, IDX, &[1, 1 << 14]);
        spd.unset_ready(DST as usize);
        unit.assign(InstrId(0), Instruction::indirect_load(IDX, DST, None, DataType::Uint32, 0), Instant::INIT);

        let mut ctx = Ctx::new(Instant::INIT, &mut spd, &mut mem);
        assert_eq!(
            unit.execute(&mut ctx),
            Outcome::OutOfRange {
                iteration: 1,
                addr: 1 << 16
            }
        );
        assert!(ctx.sent.is_empty());
        assert_eq!(unit.state(), State::Fill);
    }

    #[test]
    fn cached_lines_are_evicted() {
        let (mut spd, mut mem) = setup(8);
        let mut unit = IndirectAccessUnit::new(0, config(4, 4), mapper());
        load_u32(&mut spd, IDX, &[0, 16]);
        mem.cache(64);

        let instr = Instruction::indirect_load(IDX, DST, None, DataType::Uint32, 0);
        run(&mut unit, &mut spd, &mut mem, instr);

        assert!(!mem.is_cached(64));
        assert_eq!(unit.statistics().evictions, 1);
        assert_eq!(dst_values(&spd), [0, 160]);
    }

    #[test]
    fn foreign_responses_are_not_mine() {
        let (mut spd, mut mem) = setup(8);
        let mut unit = IndirectAccessUnit::new(0, config(4, 4), mapper());
        let mut ctx = Ctx::new(Instant::INIT, &mut spd, &mut mem);
        assert_eq!(unit.recv_data(&mut ctx, 0, &[0; 64], false), Recv::NotMine);

        load_u32(&mut spd, IDX, &[0]);
        spd.unset_ready(DST as usize);
        unit.assign(InstrId(3), Instruction::indirect_load(IDX, DST, None, DataType::Uint32, 0), Instant::INIT);
        let mut ctx = Ctx::new(Instant::INIT, &mut spd, &mut mem);
        // Fill, then build, each take a cycle.
        assert_eq!(unit.execute(&mut ctx), Outcome::Rearm(Instant::INIT + Duration::from_nanos(1)));
        let mut ctx = Ctx::new(Instant::INIT + Duration::from_nanos(1), &mut spd, &mut mem);
        assert_eq!(unit.execute(&mut ctx), Outcome::Rearm(Instant::INIT + Duration::from_nanos(2)));
        let mut ctx = Ctx::new(Instant::INIT + Duration::from_nanos(2), &mut spd, &mut mem);
        assert_eq!(unit.execute(&mut ctx), Outcome::WaitMemory);
        assert_eq!(unit.state(), State::Request);
        assert_eq!(unit.recv_data(&mut ctx, 4096, &[0; 64], false), Recv::NotMine);
        assert_eq!(unit.recv_data(&mut ctx, 0, &[0; 64], false), Recv::Mine { wake: true });
    }

    #[test]
    fn waits_for_unproduced_index() {
        let (mut spd, mut mem) = setup(8);
        let mut unit = IndirectAccessUnit::new(0, config(4, 4), mapper());
        spd.unset_ready(IDX as usize);
        spd.write(IDX as usize, 0, 4);
        spd.unset_ready(DST as usize);
        unit.assign(InstrId(0), Instruction::indirect_load(IDX, DST, None, DataType::Uint32, 0), Instant::INIT);

        let mut ctx = Ctx::new(Instant::INIT, &mut spd, &mut mem);
        assert_eq!(unit.execute(&mut ctx), Outcome::WaitTile(IDX));
        assert_eq!(unit.state(), State::Fill);
    }
}
