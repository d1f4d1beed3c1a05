//! File formats of the tProc toolchain.
//!
//! Reads and writes assembly listings and encoded word listings, and
//! compares encoded programs bit by bit.

/// Word listings (`.hex`, `.bin`) and program comparison.
///
/// One 64-bit word per line, `0x` or `0b` prefixed, as produced by
/// `Program::hex` and `Program::bin`.
pub mod loader;

/// Parser for assembly listings as rendered by `Program`.
pub mod parser;

pub use loader::{Format, WordDiff, compare_programs, load_words, parse_words, save_words};
pub use parser::{ParseError, parse_program};
