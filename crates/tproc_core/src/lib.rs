//! Program construction for the timed processor (tProc).
//!
//! This crate turns symbolic pulse sequences into the 64-bit instruction
//! words the tProc executes. It provides the register/channel model, the
//! program assembler with label resolution, pulse and timeline macros, the
//! sweep/loop generator and the standard averaging program skeleton. A small
//! reference emulator executes encoded programs so loop and sweep behavior can
//! be checked without hardware.

use tproc_common::isa::{FieldKind, Mnemonic};

/// Builder for the standard acquisition program skeleton.
///
/// Wraps user pulse code in a repetition loop (optionally nested inside a
/// parameter sweep) and publishes a shot counter to data memory after every
/// repetition, which is what the acquisition streamer polls.
pub mod averager;

/// Checked packing of operand values into instruction fields.
pub mod bit_utils;

/// Register pages and per-channel special registers.
///
/// Maps output channels to the page and register numbers that hold their
/// pulse parameters. The table is configuration supplied by the firmware
/// layer and injected at construction.
pub mod channels;

/// Instruction list, label table and binary encoding.
pub mod program;

/// Pulse descriptors and timeline macros.
///
/// Emits the register writes and `set` instructions that configure and play
/// a pulse on a channel, and keeps track of per-channel timestamps so pulses
/// can be scheduled back to back and synchronized.
pub mod pulse;

/// Nested parameter sweeps.
///
/// Expands a sweep descriptor into preload, body, increment and
/// `loopnz` instructions, checking that nested loops never share live
/// registers.
pub mod sweep;

/// Reference emulator executing encoded tProc programs.
pub mod vm;

/// Errors raised while building or encoding a program.
///
/// All of them are detected before any hardware interaction. Encoding aborts
/// on the first error; no partial program is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    /// A mnemonic name is not part of the instruction set.
    #[error("unknown mnemonic `{0}`")]
    UnknownMnemonic(String),

    /// An operator symbol is not in the operator table.
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),

    /// An instruction jumps to a label that was never defined.
    #[error("label `{label}` referenced by instruction {pc} ({mnemonic}) is never defined")]
    UnresolvedLabel {
        label: String,
        pc: usize,
        mnemonic: Mnemonic,
    },

    /// A label name that the listing format cannot represent.
    #[error("`{0}` is not a valid label name")]
    InvalidLabel(String),

    /// A label name was bound twice.
    #[error("label `{0}` is already defined")]
    DuplicateLabel(String),

    /// An operand value needs more bits than its field provides.
    ///
    /// Packing such a value would silently corrupt the neighbouring fields,
    /// so encoding refuses it.
    #[error("{mnemonic} operand {operand_index}: value {value} does not fit in {width} bits")]
    FieldOverflow {
        mnemonic: Mnemonic,
        operand_index: usize,
        value: i64,
        width: u32,
    },

    /// Wrong number of operands for a mnemonic.
    #[error("{mnemonic} takes {expected} operands, got {found}")]
    OperandCount {
        mnemonic: Mnemonic,
        expected: usize,
        found: usize,
    },

    /// An operand of the wrong kind, e.g. an integer where a label is expected.
    #[error("{mnemonic} operand {index} must be {expected:?}")]
    OperandKind {
        mnemonic: Mnemonic,
        index: usize,
        expected: FieldKind,
    },

    /// A sweep was asked to run fewer than one iteration.
    #[error("sweep `{name}` needs at least one iteration, got {count}")]
    InvalidSweepCount { name: String, count: u32 },

    /// A nested sweep reuses a register that an enclosing sweep keeps live.
    #[error("register ${reg} on page {page} is already live in loop `{owner}`")]
    RegisterCollision { page: u8, reg: u8, owner: String },

    /// A channel that is not in the register map.
    #[error("channel {0} is not in the register map")]
    UnknownChannel(u8),

    /// A channel without the requested special register.
    #[error("channel {channel} has no `{register}` register")]
    UnknownSpecialRegister {
        channel: u8,
        register: channels::SpecialRegister,
    },

    /// The register map configuration is inconsistent.
    #[error("invalid register map: {0}")]
    InvalidRegisterMap(String),

    /// Pulse parameters that cannot be expressed in the mode register.
    #[error("invalid pulse `{name}`: {reason}")]
    InvalidPulse { name: String, reason: String },
}

pub type Result<T, E = AssemblyError> = std::result::Result<T, E>;
