use crate::{HwError, Soc, pack_iq};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tproc_common::dmem::{COUNTER_ADDR, DMEM_DEPTH, PMEM_DEPTH};
use tracing::trace;

/// Accumulation buffer depth of the stock readout.
pub const DEFAULT_CAPACITY: usize = 16384;

type Schedule = Box<dyn FnMut() -> u32 + Send>;

/// One transfer served by the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    pub ch: usize,
    pub address: usize,
    pub length: usize,
}

struct SimState {
    dmem: Vec<u32>,
    pmem: Vec<u64>,
    running: bool,
    starts: usize,
    counter_addr: u32,
    count: u32,
    limit: u32,
    samples_per_count: u64,
    schedule: Schedule,
    /// Logical samples written so far; slot `i % capacity` holds sample `i`.
    written: u64,
    buffers: Vec<Vec<u64>>,
    stall: bool,
    transfers: Vec<TransferRecord>,
}

/// In-process model of a board.
///
/// While started, every read of the counter word advances the shot counter
/// by the next step of a schedule (1 by default) up to a limit, and writes
/// the corresponding samples into each readout's circular buffer, overwriting
/// the oldest ones once it wraps. Sample `i` of readout `ch` has the value
/// returned by [`SimulatedSoc::sample`], so drained data can be checked.
pub struct SimulatedSoc {
    capacity: usize,
    channels: usize,
    state: Mutex<SimState>,
}

impl SimulatedSoc {
    pub fn new(capacity: usize, channels: usize) -> Self {
        Self {
            capacity,
            channels,
            state: Mutex::new(SimState {
                dmem: vec![0; DMEM_DEPTH],
                pmem: Vec::new(),
                running: false,
                starts: 0,
                counter_addr: COUNTER_ADDR,
                count: 0,
                limit: u32::MAX,
                samples_per_count: 1,
                schedule: Box::new(|| 1),
                written: 0,
                buffers: vec![vec![0; capacity]; channels],
                stall: false,
                transfers: Vec::new(),
            }),
        }
    }

    fn with(mut self, f: impl FnOnce(&mut SimState)) -> Self {
        f(self.state.get_mut().unwrap_or_else(PoisonError::into_inner));
        self
    }

    /// Counter increment per counter read.
    pub fn with_increment(self, step: u32) -> Self {
        self.with_schedule(move || step)
    }

    /// Counter increments drawn from `schedule`, one per counter read.
    pub fn with_schedule(self, schedule: impl FnMut() -> u32 + Send + 'static) -> Self {
        self.with(|s| s.schedule = Box::new(schedule))
    }

    /// Value at which the counter stops, i.e. the program's shot count.
    pub fn with_limit(self, limit: u32) -> Self {
        self.with(|s| s.limit = limit)
    }

    /// Samples accumulated per counter increment.
    pub fn with_samples_per_count(self, samples: u64) -> Self {
        self.with(|s| s.samples_per_count = samples.max(1))
    }

    pub fn with_counter_addr(self, addr: u32) -> Self {
        self.with(|s| s.counter_addr = addr)
    }

    /// Makes every transfer hang until its timeout expires.
    pub fn with_stalled_transfers(self, stall: bool) -> Self {
        self.with(|s| s.stall = stall)
    }

    /// Value of sample `index` of readout `ch`.
    pub fn sample(ch: usize, index: u64) -> (i32, i32) {
        let i = (index as i32).wrapping_add((ch as i32).wrapping_mul(1_000_000));
        let q = (index as i32).wrapping_neg();
        (i, q)
    }

    pub fn transfers(&self) -> Result<Vec<TransferRecord>, HwError> {
        Ok(self.lock()?.transfers.clone())
    }

    pub fn program(&self) -> Result<Vec<u64>, HwError> {
        Ok(self.lock()?.pmem.clone())
    }

    /// Number of `start` calls so far.
    pub fn starts(&self) -> Result<usize, HwError> {
        Ok(self.lock()?.starts)
    }

    pub fn is_running(&self) -> Result<bool, HwError> {
        Ok(self.lock()?.running)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>, HwError> {
        self.state.lock().map_err(|_| HwError::Poisoned)
    }
}

impl SimState {
    fn tick(&mut self, capacity: usize) {
        let step = (self.schedule)();
        let count = self.count.saturating_add(step).min(self.limit);
        let target = u64::from(count) * self.samples_per_count;
        for index in self.written..target {
            let slot = (index % capacity as u64) as usize;
            for (ch, buffer) in self.buffers.iter_mut().enumerate() {
                let (i, q) = SimulatedSoc::sample(ch, index);
                buffer[slot] = pack_iq(i, q);
            }
        }
        trace!(from = self.written, to = target, "accumulated samples");
        self.written = self.written.max(target);
        self.count = count;
        self.dmem[self.counter_addr as usize] = count;
    }
}

impl Soc for SimulatedSoc {
    fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn read_mem(&self, addr: u32) -> Result<u32, HwError> {
        let mut state = self.lock()?;
        if addr as usize >= DMEM_DEPTH {
            return Err(HwError::AddressOutOfRange(addr));
        }
        if state.running && addr == state.counter_addr {
            state.tick(self.capacity);
        }
        Ok(state.dmem[addr as usize])
    }

    fn write_mem(&self, addr: u32, value: u32) -> Result<(), HwError> {
        let mut state = self.lock()?;
        if addr as usize >= DMEM_DEPTH {
            return Err(HwError::AddressOutOfRange(addr));
        }
        state.dmem[addr as usize] = value;
        if addr == state.counter_addr {
            state.count = value;
            state.written = u64::from(value) * state.samples_per_count;
        }
        Ok(())
    }

    fn start(&self) -> Result<(), HwError> {
        let mut state = self.lock()?;
        state.running = true;
        state.starts += 1;
        Ok(())
    }

    fn stop(&self) -> Result<(), HwError> {
        self.lock()?.running = false;
        Ok(())
    }

    fn transfer(
        &self,
        ch: usize,
        address: usize,
        length: usize,
        timeout: Duration,
    ) -> Result<Vec<u64>, HwError> {
        let mut state = self.lock()?;
        if state.stall {
            drop(state);
            thread::sleep(timeout);
            return Err(HwError::Timeout(timeout));
        }
        if ch >= self.channels {
            return Err(HwError::UnknownChannel(ch));
        }
        if address + length > self.capacity {
            return Err(HwError::TransferOutOfRange {
                address,
                length,
                capacity: self.capacity,
            });
        }
        state.transfers.push(TransferRecord {
            ch,
            address,
            length,
        });
        Ok(state.buffers[ch][address..address + length].to_vec())
    }

    fn load_program(&self, words: &[u64]) -> Result<(), HwError> {
        if words.len() > PMEM_DEPTH {
            return Err(HwError::AddressOutOfRange(words.len() as u32));
        }
        self.lock()?.pmem = words.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split_iq;

    #[test]
    fn counter_advances_only_while_running() {
        let soc = SimulatedSoc::new(16, 1).with_increment(3).with_limit(7);
        assert_eq!(soc.read_mem(COUNTER_ADDR).unwrap(), 0);
        soc.start().unwrap();
        let counts: Vec<u32> = (0..4).map(|_| soc.read_mem(COUNTER_ADDR).unwrap()).collect();
        assert_eq!(counts, vec![3, 6, 7, 7]);
        soc.stop().unwrap();
        assert_eq!(soc.read_mem(COUNTER_ADDR).unwrap(), 7);
    }

    #[test]
    fn buffer_wraps_and_overwrites_oldest_samples() {
        let soc = SimulatedSoc::new(8, 2).with_increment(10);
        soc.start().unwrap();
        soc.read_mem(COUNTER_ADDR).unwrap();

        let words = soc.transfer(1, 0, 4, Duration::from_millis(10)).unwrap();
        let samples: Vec<(i32, i32)> = words.into_iter().map(split_iq).collect();
        // slots 0 and 1 now hold samples 8 and 9
        assert_eq!(samples[0], SimulatedSoc::sample(1, 8));
        assert_eq!(samples[1], SimulatedSoc::sample(1, 9));
        assert_eq!(samples[2], SimulatedSoc::sample(1, 2));
    }

    #[test]
    fn transfer_may_not_cross_buffer_end() {
        let soc = SimulatedSoc::new(8, 1);
        assert!(matches!(
            soc.transfer(0, 6, 4, Duration::from_millis(10)),
            Err(HwError::TransferOutOfRange { address: 6, length: 4, capacity: 8 })
        ));
        assert!(matches!(
            soc.transfer(3, 0, 2, Duration::from_millis(10)),
            Err(HwError::UnknownChannel(3))
        ));
    }

    #[test]
    fn counter_reset_restarts_buffer_addressing() {
        let soc = SimulatedSoc::new(8, 1).with_increment(5);
        soc.start().unwrap();
        soc.read_mem(COUNTER_ADDR).unwrap();
        soc.write_mem(COUNTER_ADDR, 0).unwrap();
        soc.read_mem(COUNTER_ADDR).unwrap();
        let words = soc.transfer(0, 0, 2, Duration::from_millis(10)).unwrap();
        assert_eq!(split_iq(words[0]), SimulatedSoc::sample(0, 0));
    }

    #[test]
    fn stalled_transfer_times_out() {
        let soc = SimulatedSoc::new(8, 1).with_stalled_transfers(true);
        let timeout = Duration::from_millis(5);
        assert!(matches!(
            soc.transfer(0, 0, 2, timeout),
            Err(HwError::Timeout(t)) if t == timeout
        ));
    }

    #[test]
    fn program_is_stored() {
        let soc = SimulatedSoc::new(8, 1);
        soc.load_program(&[1, 2, 3]).unwrap();
        assert_eq!(soc.program().unwrap(), vec![1, 2, 3]);
        assert!(soc.read_mem(DMEM_DEPTH as u32).is_err());
    }
}
