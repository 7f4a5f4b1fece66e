//! Timing simulator of a map-and-access accelerator (MAA).
//!
//! The accelerator sits next to memory and executes indirect gathers, scatters and read-modify-writes over
//! index tiles held in its scratchpad. See [`maa::Maa`] for the top level.

pub mod addr_map;
pub mod indirect;
pub mod instruction;
pub mod layout;
pub mod load_config;
pub mod maa;
pub mod offset_table;
pub mod row_table;
pub mod scoreboard;
pub mod stats;

pub use instruction::{Assembler, DataType, Instruction, Opcode};
pub use maa::Maa;
