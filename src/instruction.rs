//! Instruction format of the accelerator.
//!
//! The host writes an instruction as three 64-bit words:
//!
//! | word | bits 7:0 | 15:8 | 23:16 | 31:24 | 39:32 | 47:40 | 55:48 | 63:56 |
//! |------|----------|------|-------|-------|-------|-------|-------|-------|
//! | 0 | dst2 tile | dst1 tile | optype | datatype | opcode | | | |
//! | 1 | cond tile | src3 reg | src2 reg | src1 reg | dst2 reg | dst1 reg | src2 tile | src1 tile |
//! | 2 | base address ||||||||
//!
//! `0xFF` in a tile or register field means the operand is absent.

use std::fmt;

use anyhow::{Context, bail, ensure};
use serde::Serialize;

/// Marks an absent tile or register operand.
pub const NONE: u8 = 0xFF;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Opcode {
    STREAM_LD,
    INDIR_LD,
    INDIR_ST,
    INDIR_RMW,
    RANGE_LOOP,
    ALU_SCALAR,
    ALU_VECTOR,
}

impl Opcode {
    pub fn decode(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::STREAM_LD,
            1 => Self::INDIR_LD,
            2 => Self::INDIR_ST,
            3 => Self::INDIR_RMW,
            4 => Self::RANGE_LOOP,
            5 => Self::ALU_SCALAR,
            6 => Self::ALU_VECTOR,
            _ => return None,
        })
    }

    /// The functional unit kind that executes this opcode.
    pub fn unit(self) -> FuncUnit {
        match self {
            Self::STREAM_LD => FuncUnit::Stream,
            Self::INDIR_LD | Self::INDIR_ST | Self::INDIR_RMW => FuncUnit::Indirect,
            Self::RANGE_LOOP => FuncUnit::Range,
            Self::ALU_SCALAR | Self::ALU_VECTOR => FuncUnit::Alu,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataType {
    Uint32,
    Int32,
    Float32,
    Uint64,
    Int64,
    Float64,
}

impl DataType {
    pub fn decode(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Uint32,
            1 => Self::Int32,
            2 => Self::Float32,
            3 => Self::Uint64,
            4 => Self::Int64,
            5 => Self::Float64,
            _ => return None,
        })
    }

    /// Element width in bytes.
    pub fn width(self) -> usize {
        match self {
            Self::Uint32 | Self::Int32 | Self::Float32 => 4,
            Self::Uint64 | Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Read word `wid` of a cache line.
    pub fn load(self, line: &[u8; 64], wid: usize) -> u64 {
        let w = self.width();
        let mut bytes = [0; 8];
        bytes[..w].copy_from_slice(&line[wid * w..(wid + 1) * w]);
        u64::from_le_bytes(bytes)
    }

    /// Overwrite word `wid` of a cache line.
    pub fn store(self, line: &mut [u8; 64], wid: usize, value: u64) {
        let w = self.width();
        line[wid * w..(wid + 1) * w].copy_from_slice(&value.to_le_bytes()[..w]);
    }

    /// Add two raw elements of this type. Integers wrap.
    pub fn add(self, a: u64, b: u64) -> u64 {
        match self {
            Self::Uint32 | Self::Int32 => (a as u32).wrapping_add(b as u32) as u64,
            Self::Float32 => (f32::from_bits(a as u32) + f32::from_bits(b as u32)).to_bits() as u64,
            Self::Uint64 | Self::Int64 => a.wrapping_add(b),
            Self::Float64 => (f64::from_bits(a) + f64::from_bits(b)).to_bits(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpType {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl OpType {
    pub fn decode(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Add,
            1 => Self::Sub,
            2 => Self::Mul,
            3 => Self::Div,
            4 => Self::Min,
            5 => Self::Max,
            6 => Self::Gt,
            7 => Self::Gte,
            8 => Self::Lt,
            9 => Self::Lte,
            10 => Self::Eq,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FuncUnit {
    Alu,
    Stream,
    Indirect,
    Range,
    Invalidator,
}

/// Readiness of one operand tile of a live instruction, in the order an operand moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperandStatus {
    /// The tile may still be held by the CPU caches.
    PendingInvalidation,
    Invalidating,
    /// Invalidated; waiting for a unit to produce it.
    PendingService,
    /// A unit is producing it; elements become ready one at a time.
    InService,
    Finished,
}

/// An operation descriptor. Immutable once pushed into the scoreboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub datatype: DataType,
    pub optype: OpType,
    pub src1: Option<u8>,
    pub src2: Option<u8>,
    pub cond: Option<u8>,
    pub dst1: Option<u8>,
    pub dst2: Option<u8>,
    pub src1_reg: Option<u8>,
    pub src2_reg: Option<u8>,
    pub src3_reg: Option<u8>,
    pub dst1_reg: Option<u8>,
    pub dst2_reg: Option<u8>,
    pub base_addr: u64,
}

fn field(word: u64, byte: u32) -> Option<u8> {
    let raw = (word >> (byte * 8)) as u8;
    (raw != NONE).then_some(raw)
}

fn put(field: Option<u8>, byte: u32) -> u64 {
    (field.unwrap_or(NONE) as u64) << (byte * 8)
}

impl Instruction {
    fn new(opcode: Opcode, datatype: DataType, optype: OpType, base_addr: u64) -> Self {
        Self {
            opcode,
            datatype,
            optype,
            src1: None,
            src2: None,
            cond: None,
            dst1: None,
            dst2: None,
            src1_reg: None,
            src2_reg: None,
            src3_reg: None,
            dst1_reg: None,
            dst2_reg: None,
            base_addr,
        }
    }

    /// `dst[i] = mem[base + idx[i]]`, for every `i` where `cond[i]` holds.
    pub fn indirect_load(idx: u8, dst: u8, cond: Option<u8>, datatype: DataType, base_addr: u64) -> Self {
        Self {
            src1: Some(idx),
            dst1: Some(dst),
            cond,
            ..Self::new(Opcode::INDIR_LD, datatype, OpType::Add, base_addr)
        }
    }

    /// `mem[base + idx[i]] = src[i]`, for every `i` where `cond[i]` holds.
    pub fn indirect_store(idx: u8, src: u8, cond: Option<u8>, datatype: DataType, base_addr: u64) -> Self {
        Self {
            src1: Some(idx),
            src2: Some(src),
            cond,
            ..Self::new(Opcode::INDIR_ST, datatype, OpType::Add, base_addr)
        }
    }

    /// `mem[base + idx[i]] += src[i]`, for every `i` where `cond[i]` holds.
    pub fn indirect_rmw(idx: u8, src: u8, cond: Option<u8>, datatype: DataType, base_addr: u64) -> Self {
        Self {
            src1: Some(idx),
            src2: Some(src),
            cond,
            ..Self::new(Opcode::INDIR_RMW, datatype, OpType::Add, base_addr)
        }
    }

    pub fn decode(words: [u64; 3]) -> anyhow::Result<Self> {
        let [w0, w1, w2] = words;

        let raw_opcode = (w0 >> 32) as u8;
        let opcode = Opcode::decode(raw_opcode).with_context(|| format!("unknown opcode {raw_opcode}"))?;
        let raw_datatype = (w0 >> 24) as u8;
        let datatype =
            DataType::decode(raw_datatype).with_context(|| format!("unknown datatype {raw_datatype}"))?;
        let raw_optype = (w0 >> 16) as u8;
        let optype = match OpType::decode(raw_optype) {
            Some(optype) => optype,
            // Units other than the ALU and RMW ignore the optype.
            None if raw_optype == NONE => OpType::Add,
            None => bail!("unknown optype {raw_optype}"),
        };

        let instr = Self {
            opcode,
            datatype,
            optype,
            dst2: field(w0, 0),
            dst1: field(w0, 1),
            cond: field(w1, 0),
            src3_reg: field(w1, 1),
            src2_reg: field(w1, 2),
            src1_reg: field(w1, 3),
            dst2_reg: field(w1, 4),
            dst1_reg: field(w1, 5),
            src2: field(w1, 6),
            src1: field(w1, 7),
            base_addr: w2,
        };
        instr.check_operands()?;
        Ok(instr)
    }

    pub fn encode(&self) -> [u64; 3] {
        let w0 = put(self.dst2, 0)
            | put(self.dst1, 1)
            | (self.optype as u64) << 16
            | (self.datatype as u64) << 24
            | (self.opcode as u64) << 32;
        let w1 = put(self.cond, 0)
            | put(self.src3_reg, 1)
            | put(self.src2_reg, 2)
            | put(self.src1_reg, 3)
            | put(self.dst2_reg, 4)
            | put(self.dst1_reg, 5)
            | put(self.src2, 6)
            | put(self.src1, 7);
        [w0, w1, self.base_addr]
    }

    fn check_operands(&self) -> anyhow::Result<()> {
        match self.opcode {
            Opcode::INDIR_LD => {
                ensure!(self.src1.is_some(), "{}: missing index tile", self.opcode_name());
                ensure!(self.dst1.is_some(), "{}: missing destination tile", self.opcode_name());
            }
            Opcode::INDIR_ST | Opcode::INDIR_RMW => {
                ensure!(self.src1.is_some(), "{}: missing index tile", self.opcode_name());
                ensure!(self.src2.is_some(), "{}: missing source tile", self.opcode_name());
                ensure!(self.dst1.is_none(), "{}: unexpected destination tile", self.opcode_name());
            }
            _ => {}
        }
        if self.opcode == Opcode::INDIR_RMW {
            ensure!(self.optype == OpType::Add, "INDIR_RMW only supports ADD, got {:?}", self.optype);
        }
        Ok(())
    }

    fn opcode_name(&self) -> String {
        format!("{:?}", self.opcode)
    }

    /// Source and predicate tiles.
    pub fn sources(&self) -> impl Iterator<Item = u8> + '_ {
        [self.src1, self.src2, self.cond].into_iter().flatten()
    }

    pub fn destinations(&self) -> impl Iterator<Item = u8> + '_ {
        [self.dst1, self.dst2].into_iter().flatten()
    }

    /// Every tile the instruction references.
    pub fn tiles(&self) -> impl Iterator<Item = u8> + '_ {
        self.sources().chain(self.destinations())
    }
}

fn tile(f: &mut fmt::Formatter<'_>, name: &str, t: Option<u8>) -> fmt::Result {
    match t {
        Some(t) => write!(f, " {name}[T{t}]"),
        None => Ok(()),
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{:?}", self.opcode, self.datatype)?;
        if self.opcode.unit() == FuncUnit::Alu || self.opcode == Opcode::INDIR_RMW {
            write!(f, ".{:?}", self.optype)?;
        }
        tile(f, "dst1", self.dst1)?;
        tile(f, "dst2", self.dst2)?;
        tile(f, "src1", self.src1)?;
        tile(f, "src2", self.src2)?;
        tile(f, "cond", self.cond)?;
        write!(f, " base[{:#x}]", self.base_addr)
    }
}

/// Collects instruction words as the host writes them.
#[derive(Default)]
pub struct Assembler {
    words: [u64; 3],
    filled: usize,
}

impl Assembler {
    /// Accept the next word, yielding an instruction on every third.
    pub fn push(&mut self, word: u64) -> anyhow::Result<Option<Instruction>> {
        self.words[self.filled] = word;
        self.filled += 1;
        if self.filled < 3 {
            return Ok(None);
        }
        self.filled = 0;
        Instruction::decode(self.words).map(Some)
    }

    /// Whether a partially written instruction is pending.
    pub fn is_partial(&self) -> bool {
        self.filled != 0
    }

    /// Assemble a whole program.
    pub fn assemble(words: &[u64]) -> anyhow::Result<Vec<Instruction>> {
        let mut asm = Self::default();
        let mut program = Vec::new();
        for (i, &word) in words.iter().enumerate() {
            if let Some(instr) = asm.push(word).with_context(|| format!("instruction {}", i / 3))? {
                program.push(instr);
            }
        }
        ensure!(!asm.is_partial(), "program ends with an incomplete instruction");
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fields() {
        // INDIR_LD.Float32 dst1=T3, src1=T1, cond=T2, base 0x1000.
        let w0 = 0x01_02_00_03_FF;
        let w1 = 0x01_FF_FF_FF_FF_FF_FF_02;
        let instr = Instruction::decode([w0, w1, 0x1000]).unwrap();

        assert_eq!(instr.opcode, Opcode::INDIR_LD);
        assert_eq!(instr.datatype, DataType::Float32);
        assert_eq!(instr.dst1, Some(3));
        assert_eq!(instr.dst2, None);
        assert_eq!(instr.src1, Some(1));
        assert_eq!(instr.src2, None);
        assert_eq!(instr.cond, Some(2));
        assert_eq!(instr.base_addr, 0x1000);
        assert_eq!(instr.encode(), [w0, w1, 0x1000]);
        assert_eq!(
            instr.to_string(),
            "INDIR_LD.Float32 dst1[T3] src1[T1] cond[T2] base[0x1000]"
        );
    }

    #[test]
    fn assembler_yields_every_third_word() {
        let program = [
            Instruction::indirect_load(0, 1, None, DataType::Uint32, 0),
            Instruction::indirect_rmw(0, 1, Some(2), DataType::Int64, 64),
        ];
        let words: Vec<u64> = program.iter().flat_map(|i| i.encode()).collect();

        let mut asm = Assembler::default();
        assert!(asm.push(words[0]).unwrap().is_none());
        assert!(asm.push(words[1]).unwrap().is_none());
        assert_eq!(asm.push(words[2]).unwrap(), Some(program[0]));

        assert_eq!(Assembler::assemble(&words).unwrap(), program);
        assert!(Assembler::assemble(&words[..4]).is_err());
    }

    #[test]
    fn rejects_malformed() {
        let load = Instruction::indirect_load(0, 1, None, DataType::Uint32, 0).encode();

        let mut bad_opcode = load;
        bad_opcode[0] |= 0x7F << 32;
        assert!(Instruction::decode(bad_opcode).is_err());

        // Index tile removed.
        let mut no_index = load;
        no_index[1] |= 0xFF << 56;
        assert!(Instruction::decode(no_index).is_err());

        let mut rmw = Instruction::indirect_rmw(0, 1, None, DataType::Uint32, 0);
        rmw.optype = OpType::Max;
        assert!(Instruction::decode(rmw.encode()).is_err());
    }

    #[test]
    fn word_access() {
        let mut line = [0u8; 64];
        DataType::Uint32.store(&mut line, 3, 0xdead_beef_1234_5678);
        assert_eq!(DataType::Uint32.load(&line, 3), 0x1234_5678);
        assert_eq!(line[12..16], 0x1234_5678u32.to_le_bytes());

        DataType::Float64.store(&mut line, 7, 2.5f64.to_bits());
        let sum = DataType::Float64.add(DataType::Float64.load(&line, 7), 0.5f64.to_bits());
        assert_eq!(f64::from_bits(sum), 3.0);
        assert_eq!(DataType::Int32.add(u32::MAX as u64, 2), 1);
    }
}
