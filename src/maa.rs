//! The accelerator: scoreboard, invalidation unit, indirect access lanes and their shared memory port, driven
//! by one event queue.

use anyhow::{Context, anyhow, ensure};
use log::{debug, error, info, trace, warn};
use memory::{MemoryBacked, MemoryTimingModel, NaiveTiming, Response, SimpleTiming, Transport};
use runtime::{Duration, Executor, Instant};
use scratchpad::Scratchpad;

use crate::addr_map::{AddrMapper, Organization};
use crate::indirect::{Ctx, EngineConfig, IndirectAccessUnit, Outcome, Recv};
use crate::instruction::{FuncUnit, Instruction};
use crate::load_config::{AcceleratorConfig, DramSection, TimingModel};
use crate::scoreboard::{InstrId, Scoreboard};
use crate::stats::{Report, TransportReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Run an indirect access lane.
    Execute(usize),
    /// Packets in the transport may have completed.
    TransportReady,
    /// The transport has room for a lane it turned away.
    RetrySend(usize),
    InvalidateDone(InstrId),
}

fn timing_model(dram: &DramSection) -> Box<dyn MemoryTimingModel> {
    let tck = Duration::from_picos(dram.tck_ps.value);
    match dram.timing_model {
        TimingModel::Naive => Box::new(NaiveTiming::new(
            tck,
            dram.cas.value,
            dram.bus_width.value,
            dram.channels.value,
        )),
        TimingModel::Simple => {
            let banks = dram.channels.value * dram.ranks.value * dram.bankgroups.value * dram.banks_per_group.value;
            Box::new(SimpleTiming::new(
                tck,
                dram.cas.value,
                dram.rcd.value,
                dram.rp.value,
                dram.bus_width.value,
                dram.rows.value.ilog2(),
                banks.ilog2(),
                dram.channels.value,
            ))
        }
    }
}

struct Invalidator {
    busy: Option<InstrId>,
    /// Cycles per tile.
    latency: u32,
    tiles_invalidated: u64,
}

struct Accelerator {
    period: Duration,
    physical_offset: u64,
    spd: Scratchpad,
    sb: Scoreboard,
    lanes: Vec<IndirectAccessUnit>,
    /// Lanes with an `Execute` event queued.
    armed: Vec<bool>,
    /// `(tile, lane)` pairs of lanes waiting for an element of the tile.
    waiters: Vec<(u8, usize)>,
    mem: Transport,
    invalidator: Invalidator,
    finished: u64,
    /// First access outside of memory. The faulting lane stops.
    fault: Option<anyhow::Error>,
}

impl Accelerator {
    fn dispatch(&mut self, exec: &mut Executor<Event>, event: Event) {
        trace!("MAA: {event:?} at {:?}", exec.now());
        match event {
            Event::Execute(lane) => self.execute(exec, lane),
            Event::TransportReady => self.transport_ready(exec),
            Event::RetrySend(lane) => self.retry_send(exec, lane),
            Event::InvalidateDone(id) => self.invalidate_done(exec, id),
        }
    }

    fn arm(&mut self, exec: &mut Executor<Event>, lane: usize, at: Instant) {
        if !self.armed[lane] {
            self.armed[lane] = true;
            exec.schedule(at, Event::Execute(lane));
        }
    }

    fn wake_tile(&mut self, exec: &mut Executor<Event>, tile: u8) {
        let now = exec.now();
        let mut woken = Vec::new();
        self.waiters.retain(|&(t, lane)| {
            if t == tile {
                woken.push(lane);
                false
            } else {
                true
            }
        });
        for lane in woken {
            self.arm(exec, lane, now);
        }
    }

    fn expect_completions(exec: &mut Executor<Event>, sent: Vec<Instant>) {
        for at in sent {
            exec.schedule(at, Event::TransportReady);
        }
    }

    fn execute(&mut self, exec: &mut Executor<Event>, lane: usize) {
        self.armed[lane] = false;
        let mut ctx = Ctx::new(exec.now(), &mut self.spd, &mut self.mem);
        let outcome = self.lanes[lane].execute(&mut ctx);
        Self::expect_completions(exec, ctx.sent);

        // False predicates write result elements directly.
        if let Some(tile) = self.lanes[lane].dst_tile() {
            self.wake_tile(exec, tile);
        }
        match outcome {
            Outcome::Rearm(at) => self.arm(exec, lane, at),
            Outcome::WaitTile(tile) => self.waiters.push((tile, lane)),
            Outcome::WaitMemory | Outcome::Idle => {}
            Outcome::Finished(id) => self.finish(exec, lane, id),
            Outcome::OutOfRange { iteration, addr } => self.out_of_range(lane, iteration, addr),
        }
    }

    fn out_of_range(&mut self, lane: usize, iteration: usize, addr: u64) {
        let size = self.mem.memory().size_in_bytes();
        let instr = match self.lanes[lane].current() {
            Some(id) => format!("{id} ({})", self.sb.get(id)),
            None => "an idle lane".to_string(),
        };
        error!("I[{lane}]: element {iteration} of {instr} accesses {addr:#x}, beyond {size} bytes of memory");
        if self.fault.is_none() {
            self.fault = Some(anyhow!(
                "element {iteration} of {instr} accesses {addr:#x}, beyond {size} bytes of memory"
            ));
        }
    }

    fn finish(&mut self, exec: &mut Executor<Event>, lane: usize, id: InstrId) {
        let instr = *self.sb.get(id);
        for tile in instr.destinations() {
            self.spd.set_ready(tile as usize);
        }
        self.sb.finish_compute(id);
        self.finished += 1;
        debug!("MAA: {id} finished on I[{lane}] at {:?}", exec.now());

        for tile in instr.destinations() {
            self.wake_tile(exec, tile);
        }
        self.issue(exec);
    }

    fn transport_ready(&mut self, exec: &mut Executor<Event>) {
        for response in self.mem.complete(exec.now()) {
            self.deliver(exec, response);
        }
        for lane in self.mem.take_unblocked() {
            exec.spawn(Event::RetrySend(lane));
        }
    }

    /// Offer a read response to its requestor first, then to the other lanes.
    fn deliver(&mut self, exec: &mut Executor<Event>, response: Response) {
        let now = exec.now();
        let n = self.lanes.len();
        for k in 0..n {
            let lane = (response.requestor + k) % n;
            let mut ctx = Ctx::new(now, &mut self.spd, &mut self.mem);
            let recv = self.lanes[lane].recv_data(&mut ctx, response.addr, &response.data, response.was_cached);
            Self::expect_completions(exec, ctx.sent);

            if let Recv::Mine { wake } = recv {
                if let Some(tile) = self.lanes[lane].dst_tile() {
                    self.wake_tile(exec, tile);
                }
                if wake {
                    self.arm(exec, lane, now);
                }
                return;
            }
        }
        warn!("MAA: response for {:#x} claimed by no unit", response.addr);
    }

    fn retry_send(&mut self, exec: &mut Executor<Event>, lane: usize) {
        let now = exec.now();
        let mut ctx = Ctx::new(now, &mut self.spd, &mut self.mem);
        let wake = self.lanes[lane].retry(&mut ctx);
        Self::expect_completions(exec, ctx.sent);
        if wake {
            self.arm(exec, lane, now);
        }
    }

    fn invalidate_done(&mut self, exec: &mut Executor<Event>, id: InstrId) {
        assert_eq!(self.invalidator.busy, Some(id), "INV: unexpected completion of {id}");
        self.invalidator.busy = None;
        self.sb.finish_invalidate(id);
        self.issue(exec);
    }

    /// Hand ready instructions to the invalidator and to idle lanes.
    fn issue(&mut self, exec: &mut Executor<Event>) {
        let now = exec.now();
        if self.invalidator.busy.is_none()
            && let Some(id) = self.sb.get_ready(FuncUnit::Invalidator)
        {
            let tiles = self.sb.invalidating_tiles(id);
            debug!("INV: {id} invalidating {tiles:?}");
            self.invalidator.busy = Some(id);
            self.invalidator.tiles_invalidated += tiles.len() as u64;
            let cycles = self.invalidator.latency * tiles.len() as u32;
            exec.schedule(self.period * cycles, Event::InvalidateDone(id));
        }

        for lane in 0..self.lanes.len() {
            if !self.lanes[lane].is_idle() {
                continue;
            }
            let Some(id) = self.sb.get_ready(FuncUnit::Indirect) else {
                break;
            };
            let instr = *self.sb.get(id);
            self.lanes[lane].assign(id, instr, now);
            self.arm(exec, lane, now);
        }
    }
}

/// Map-and-access accelerator.
pub struct Maa {
    executor: Executor<Event>,
    acc: Accelerator,
}

impl Maa {
    pub fn new(config: &AcceleratorConfig) -> Self {
        let c = &config.config;
        let period = Duration::from_picos(c.clock_period_ps.value);
        let mapper = AddrMapper::new(Organization::from(&config.dram));
        let engine = EngineConfig::from(config);
        let lanes = (0..c.num_indirect_access_units.value)
            .map(|id| IndirectAccessUnit::new(id, engine.clone(), mapper.clone()))
            .collect();
        let mem = Transport::new(
            timing_model(&config.dram),
            MemoryBacked::with_capacity(c.hbm_size.value),
            config.dram.transport_capacity.value,
            period * config.dram.cache_hit_latency.value,
        );

        Self {
            executor: Executor::new(),
            acc: Accelerator {
                period,
                physical_offset: c.physical_offset.value,
                spd: Scratchpad::new(
                    c.num_tiles.value,
                    c.num_tile_elements.value,
                    config.latency.spd_access.value,
                    config.latency.spd_words_per_access.value,
                ),
                sb: Scoreboard::new(c.num_instructions.value),
                armed: vec![false; c.num_indirect_access_units.value],
                lanes,
                waiters: Vec::new(),
                mem,
                invalidator: Invalidator {
                    busy: None,
                    latency: config.latency.invalidate_tile.value,
                    tiles_invalidated: 0,
                },
                finished: 0,
                fault: None,
            },
        }
    }

    pub fn now(&self) -> Instant {
        self.executor.now()
    }

    /// Check that the accelerator can execute `instr`.
    pub fn validate(&self, instr: &Instruction) -> anyhow::Result<()> {
        let unit = instr.opcode.unit();
        ensure!(unit == FuncUnit::Indirect, "{instr}: no {unit:?} unit in this accelerator");
        let num_tiles = self.acc.spd.num_tiles();
        for tile in instr.tiles() {
            ensure!((tile as usize) < num_tiles, "{instr}: T{tile} out of range ({num_tiles} tiles)");
        }
        for dst in instr.destinations() {
            ensure!(!instr.sources().any(|s| s == dst), "{instr}: T{dst} is both read and written");
        }
        let width = instr.datatype.width() as u64;
        let start = instr
            .base_addr
            .checked_add(self.acc.physical_offset)
            .with_context(|| format!("{instr}: base address overflows with offset {:#x}", self.acc.physical_offset))?;
        let size = self.acc.mem.memory().size_in_bytes() as u64;
        ensure!(start < size, "{instr}: base address {start:#x} is beyond {size} bytes of memory");
        ensure!(start.is_multiple_of(width), "{instr}: base address is not {width}-byte aligned");
        Ok(())
    }

    /// Offer an instruction. Returns false if the scoreboard cannot take it now.
    ///
    /// Panics if the instruction does not pass [`Maa::validate`].
    pub fn push(&mut self, instr: Instruction) -> bool {
        if let Err(e) = self.validate(&instr) {
            panic!("MAA: {e:#}");
        }
        let Some(id) = self.acc.sb.push(instr) else {
            return false;
        };
        debug!("MAA: {id} accepted {instr}");
        for tile in instr.destinations() {
            self.acc.spd.unset_ready(tile as usize);
        }
        self.acc.issue(&mut self.executor);
        true
    }

    /// Process events until the queue empties or the next event is at or after `timeout`.
    pub fn run(&mut self, timeout: Instant) -> u64 {
        let events = self.executor.enter(timeout, &mut self.acc, Accelerator::dispatch);
        trace!("MAA: {events} events, now {:?}", self.executor.now());
        events
    }

    /// Process a single event. Returns false if none is queued.
    pub fn step(&mut self) -> bool {
        let Some((_, event)) = self.executor.pop() else {
            return false;
        };
        self.acc.dispatch(&mut self.executor, event);
        true
    }

    /// Feed a whole program, stalling on a full scoreboard, and run it to completion.
    pub fn run_program(&mut self, program: &[Instruction]) -> anyhow::Result<()> {
        for (i, instr) in program.iter().enumerate() {
            self.validate(instr).with_context(|| format!("instruction {i}"))?;
            while !self.push(*instr) {
                self.take_fault()?;
                ensure!(self.step(), "instruction {i} ({instr}) can never be accepted");
            }
        }
        self.run(Instant::ETERNITY);
        self.take_fault()?;
        ensure!(
            self.is_idle(),
            "simulation stalled with {} live instructions",
            self.acc.sb.num_live()
        );
        info!(
            "MAA: {} instructions finished at {:?}",
            self.acc.finished,
            self.executor.now()
        );
        Ok(())
    }

    /// The first out-of-memory access since the last call, if any. The lane that made it never finishes.
    pub fn take_fault(&mut self) -> anyhow::Result<()> {
        match self.acc.fault.take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// No instruction is live.
    pub fn is_idle(&self) -> bool {
        self.acc.sb.is_empty()
    }

    /// Host write of one tile element.
    pub fn write_tile(&mut self, tile: usize, index: usize, word: u64) {
        self.acc.spd.write(tile, index, word);
        self.acc.wake_tile(&mut self.executor, tile as u8);
    }

    /// Host preload of a whole tile from little-endian elements of `width` bytes.
    pub fn load_tile(&mut self, tile: usize, width: usize, bytes: &[u8]) {
        self.acc.spd.load_from_bytes(tile, width, bytes);
        self.acc.wake_tile(&mut self.executor, tile as u8);
    }

    pub fn read_tile(&self, tile: usize, index: usize) -> u64 {
        self.acc.spd.read(tile, index)
    }

    pub fn scratchpad(&self) -> &Scratchpad {
        &self.acc.spd
    }

    pub fn memory(&self) -> &Transport {
        &self.acc.mem
    }

    pub fn memory_mut(&mut self) -> &mut Transport {
        &mut self.acc.mem
    }

    pub fn lanes(&self) -> &[IndirectAccessUnit] {
        &self.acc.lanes
    }

    pub fn stats(&self) -> Report {
        Report {
            simulated_ns: self.executor.now().as_picos() as f64 / 1000.0,
            instructions_finished: self.acc.finished,
            tiles_invalidated: self.acc.invalidator.tiles_invalidated,
            indirect: self.acc.lanes.iter().map(|l| l.statistics().clone()).collect(),
            transport: TransportReport::new(self.acc.mem.statistics(), self.acc.mem.memory_statistics()),
        }
    }
}
