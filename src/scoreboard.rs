use std::collections::BTreeSet;

use log::debug;

use crate::instruction::{FuncUnit, Instruction, OperandStatus};

/// Handle of an instruction held by the [`Scoreboard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrId(pub usize);

impl std::fmt::Display for InstrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IF[{}]", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Operand {
    tile: u8,
    dst: bool,
    status: OperandStatus,
}

struct Slot {
    instr: Instruction,
    operands: Vec<Operand>,
    claimed: bool,
}

/// Tracks the live instructions and the readiness of the tiles they touch.
///
/// Every scan goes over the slots in index order and the first match wins.
pub struct Scoreboard {
    slots: Vec<Option<Slot>>,
    free: BTreeSet<usize>,
}

impl Scoreboard {
    pub fn new(num_instructions: usize) -> Self {
        Self {
            slots: (0..num_instructions).map(|_| None).collect(),
            free: (0..num_instructions).collect(),
        }
    }

    fn live(&self) -> impl Iterator<Item = (usize, &Slot)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|s| (i, s)))
    }

    /// Status of `tile` as seen by live instructions writing it, if any.
    fn producer_status(&self, tile: u8) -> Option<OperandStatus> {
        self.live()
            .flat_map(|(_, s)| s.operands.iter())
            .find(|op| op.dst && op.tile == tile)
            .map(|op| op.status)
    }

    /// Accept a new instruction.
    ///
    /// Fails when every slot is taken, or when the instruction would write a tile that a live instruction
    /// reads or writes.
    pub fn push(&mut self, instr: Instruction) -> Option<InstrId> {
        for (i, slot) in self.live() {
            let old = &slot.instr;
            if let Some(tile) = instr
                .destinations()
                .find(|&d| old.destinations().chain(old.sources()).any(|t| t == d))
            {
                debug!("IF: {instr} rejected, T{tile} in use by IF[{i}]");
                return None;
            }
        }
        let &slot = self.free.first()?;

        let mut operands = Vec::new();
        for tile in instr.sources() {
            let status = self.producer_status(tile).unwrap_or(OperandStatus::Finished);
            operands.push(Operand {
                tile,
                dst: false,
                status,
            });
        }
        for tile in instr.destinations() {
            operands.push(Operand {
                tile,
                dst: true,
                status: OperandStatus::PendingInvalidation,
            });
        }

        self.free.remove(&slot);
        self.slots[slot] = Some(Slot {
            instr,
            operands,
            claimed: false,
        });
        debug!("IF[{slot}]: pushed {instr}");
        Some(InstrId(slot))
    }

    /// Move every reference to `tile` in instructions other than `except` from a status in `from` to `to`.
    fn propagate(&mut self, except: usize, tile: u8, from: &[OperandStatus], to: OperandStatus) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let Some(slot) = slot else { continue };
            if i == except {
                continue;
            }
            for op in slot.operands.iter_mut().filter(|op| op.tile == tile) {
                if from.contains(&op.status) {
                    op.status = to;
                }
            }
        }
    }

    /// Claim the next instruction for a unit of kind `unit`.
    pub fn get_ready(&mut self, unit: FuncUnit) -> Option<InstrId> {
        if unit == FuncUnit::Invalidator {
            let i = self.live().find_map(|(i, s)| {
                s.operands
                    .iter()
                    .any(|op| op.status == OperandStatus::PendingInvalidation)
                    .then_some(i)
            })?;
            let tiles = self.promote(i, OperandStatus::PendingInvalidation, OperandStatus::Invalidating);
            for tile in tiles {
                self.propagate(
                    i,
                    tile,
                    &[OperandStatus::PendingInvalidation],
                    OperandStatus::Invalidating,
                );
            }
            debug!("IF[{i}]: invalidating");
            return Some(InstrId(i));
        }

        let i = self.live().find_map(|(i, s)| {
            let ready = !s.claimed
                && s.instr.opcode.unit() == unit
                && s.operands.iter().all(|op| {
                    if op.dst {
                        op.status == OperandStatus::PendingService
                    } else {
                        op.status >= OperandStatus::InService
                    }
                });
            ready.then_some(i)
        })?;

        let tiles = self.promote(i, OperandStatus::PendingService, OperandStatus::InService);
        if let Some(slot) = self.slots[i].as_mut() {
            slot.claimed = true;
        }
        for tile in tiles {
            self.propagate(
                i,
                tile,
                &[OperandStatus::PendingService],
                OperandStatus::InService,
            );
        }
        debug!("IF[{i}]: issued to {unit:?}");
        Some(InstrId(i))
    }

    /// Move the operands of slot `i` in status `from` to `to`, returning their tiles.
    fn promote(&mut self, i: usize, from: OperandStatus, to: OperandStatus) -> Vec<u8> {
        let Some(slot) = self.slots[i].as_mut() else {
            panic!("IF[{i}]: promoting a free slot");
        };
        let mut tiles = Vec::new();
        for op in slot.operands.iter_mut().filter(|op| op.status == from) {
            op.status = to;
            tiles.push(op.tile);
        }
        tiles
    }

    /// Tiles of `id` currently being invalidated.
    pub fn invalidating_tiles(&self, id: InstrId) -> Vec<u8> {
        self.slot(id)
            .operands
            .iter()
            .filter(|op| op.status == OperandStatus::Invalidating)
            .map(|op| op.tile)
            .collect()
    }

    /// The invalidation of `id`'s tiles is done; they can now be produced.
    pub fn finish_invalidate(&mut self, id: InstrId) {
        let tiles = self.promote(id.0, OperandStatus::Invalidating, OperandStatus::PendingService);
        assert!(!tiles.is_empty(), "{id}: nothing was being invalidated");
        for tile in tiles {
            self.propagate(
                id.0,
                tile,
                &[OperandStatus::PendingInvalidation, OperandStatus::Invalidating],
                OperandStatus::PendingService,
            );
        }
        debug!("{id}: invalidation finished");
    }

    /// `id` completed: its destinations are final and its slot is released.
    pub fn finish_compute(&mut self, id: InstrId) {
        let Some(slot) = self.slots[id.0].take() else {
            panic!("{id}: finishing a free slot");
        };
        assert!(slot.claimed, "{id}: finished without being issued");
        for op in slot.operands.iter().filter(|op| op.dst) {
            assert_eq!(op.status, OperandStatus::InService, "{id}: T{} finished out of order", op.tile);
            self.propagate(
                id.0,
                op.tile,
                &[OperandStatus::InService],
                OperandStatus::Finished,
            );
        }
        self.free.insert(id.0);
        debug!("{id}: finished");
    }

    fn slot(&self, id: InstrId) -> &Slot {
        match &self.slots[id.0] {
            Some(slot) => slot,
            None => panic!("{id}: slot is free"),
        }
    }

    pub fn get(&self, id: InstrId) -> &Instruction {
        &self.slot(id).instr
    }

    /// Status of `tile` as an operand of `id`.
    pub fn status(&self, id: InstrId, tile: u8) -> Option<OperandStatus> {
        self.slot(id).operands.iter().find(|op| op.tile == tile).map(|op| op.status)
    }

    pub fn num_live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_live() == 0
    }
}
