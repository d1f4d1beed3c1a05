//! Hardware side of the tProc toolchain.
//!
//! The acquisition streamer drains the readout's circular accumulation buffer
//! while a program runs. It talks to the board through the [`Soc`] trait,
//! which has two implementations here: [`sim::SimulatedSoc`], an in-process
//! model with a real circular buffer and a deterministic counter, and
//! [`bridge::BridgeSoc`], a TCP client for a remote board or co-simulation.

use std::time::Duration;

/// TCP backend and the matching server loop.
pub mod bridge;

/// In-process board model.
pub mod sim;

/// Background readout of the accumulation buffers.
///
/// A worker thread polls the program's shot counter, drains newly
/// accumulated samples in strides, and hands them to the caller through a
/// channel. The caller observes progress with non-blocking polls and can stop
/// the worker cooperatively.
pub mod streamer;

/// Failures of a single hardware operation.
#[derive(Debug, thiserror::Error)]
pub enum HwError {
    /// A transfer did not complete within its deadline.
    #[error("transfer did not complete within {0:?}")]
    Timeout(Duration),

    /// A transfer window extends past the end of the buffer.
    #[error("transfer of {length} samples at {address} exceeds buffer of {capacity}")]
    TransferOutOfRange {
        address: usize,
        length: usize,
        capacity: usize,
    },

    #[error("no readout channel {0}")]
    UnknownChannel(usize),

    #[error("memory address {0} out of range")]
    AddressOutOfRange(u32),

    #[error("bridge I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge protocol violation: {0}")]
    Protocol(String),

    /// A thread panicked while holding the simulation state.
    #[error("simulation state poisoned")]
    Poisoned,
}

/// Control and data path of a board running the tProc.
///
/// Implementations are shared between the caller and the readout worker,
/// so every method takes `&self`.
pub trait Soc: Send + Sync {
    /// Number of samples the accumulation buffer of each readout holds.
    fn buffer_capacity(&self) -> usize;

    /// Reads one 32-bit word of tProc data memory.
    fn read_mem(&self, addr: u32) -> Result<u32, HwError>;

    /// Writes one 32-bit word of tProc data memory.
    fn write_mem(&self, addr: u32, value: u32) -> Result<(), HwError>;

    /// Starts the tProc. Starting a running processor restarts it.
    fn start(&self) -> Result<(), HwError>;

    /// Stops the tProc. Stopping a stopped processor is a no-op.
    fn stop(&self) -> Result<(), HwError>;

    /// Reads `length` accumulated samples of readout `ch` starting at
    /// `address`.
    ///
    /// Each returned word packs I in its low and Q in its high 32 bits. The
    /// window must not cross the end of the buffer.
    ///
    /// # Returns
    ///
    /// `HwError::Timeout` when the transfer does not finish within `timeout`.
    fn transfer(
        &self,
        ch: usize,
        address: usize,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u64>, HwError>;

    /// Writes program words to program memory.
    fn load_program(&self, words: &[u64]) -> Result<(), HwError>;
}

/// Splits a 64-bit accumulated word into its signed I and Q halves.
#[inline]
pub fn split_iq(word: u64) -> (i32, i32) {
    (word as u32 as i32, (word >> 32) as u32 as i32)
}

/// Packs signed I and Q values into one accumulated word.
#[inline]
pub fn pack_iq(i: i32, q: i32) -> u64 {
    u64::from(q as u32) << 32 | u64::from(i as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iq_halves_are_signed() {
        let word = pack_iq(-5, 7);
        assert_eq!(word & 0xFFFF_FFFF, u64::from((-5i32) as u32));
        assert_eq!(split_iq(word), (-5, 7));
        assert_eq!(split_iq(0xFFFF_FFFF_0000_0001), (1, -1));
    }
}
