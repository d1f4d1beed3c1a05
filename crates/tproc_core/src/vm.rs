//! Reference emulator for encoded tProc programs.
//!
//! Executes 64-bit instruction words through the ISA decode table: eight
//! pages of 32 registers (register 0 always reads zero), a data memory, and
//! a time offset advanced by `sync`/`synci`. Every `set` and `seti` is
//! recorded as an [`Event`] at its absolute time, which is enough to check
//! loop trip counts and swept register values without hardware.

use tproc_common::dmem::DMEM_DEPTH;
use tproc_common::isa::{self, Decoded, Mnemonic, immediate_value};

use crate::channels::{NUM_PAGES, REGS_PER_PAGE};

/// Default number of instructions executed before giving up.
pub const DEFAULT_STEP_LIMIT: u64 = 1 << 24;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmulatorError {
    #[error("word {word:#018x} at pc {pc} has no valid opcode")]
    InvalidOpcode { pc: usize, word: u64 },

    #[error("{mnemonic} at pc {pc} is not supported by the emulator")]
    Unsupported { pc: usize, mnemonic: Mnemonic },

    #[error("operator code {code:#06b} is not valid for {mnemonic} at pc {pc}")]
    InvalidOperator { pc: usize, mnemonic: Mnemonic, code: u8 },

    #[error("program did not reach `end` within {0} steps")]
    StepLimit(u64),

    #[error("program counter {0} is past the last instruction")]
    PcOutOfRange(usize),

    #[error("data memory address {addr} out of range at pc {pc}")]
    DmemOutOfRange { pc: usize, addr: u64 },
}

/// Channel update observed while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `set`: all pulse registers of a channel latched at `time`.
    Set {
        ch: u8,
        time: i64,
        freq: u32,
        phase: u32,
        addr: u32,
        gain: u32,
        mode: u32,
    },
    /// `seti`: one register value written to a channel (trigger outputs).
    Seti { ch: u8, time: i64, value: u32 },
}

impl Event {
    pub fn channel(&self) -> u8 {
        match self {
            Event::Set { ch, .. } | Event::Seti { ch, .. } => *ch,
        }
    }

    pub fn time(&self) -> i64 {
        match self {
            Event::Set { time, .. } | Event::Seti { time, .. } => *time,
        }
    }
}

pub struct Emulator {
    words: Vec<u64>,
    regs: [[u32; REGS_PER_PAGE as usize]; NUM_PAGES as usize],
    dmem: Vec<u32>,
    pc: usize,
    time_offset: i64,
    events: Vec<Event>,
    steps: u64,
    step_limit: u64,
    halted: bool,
}

impl Emulator {
    pub fn new(words: Vec<u64>) -> Self {
        Self {
            words,
            regs: [[0; REGS_PER_PAGE as usize]; NUM_PAGES as usize],
            dmem: vec![0; DMEM_DEPTH],
            pc: 0,
            time_offset: 0,
            events: Vec::new(),
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
            halted: false,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn reg(&self, page: u8, reg: u8) -> u32 {
        self.regs[page as usize % NUM_PAGES as usize][reg as usize % REGS_PER_PAGE as usize]
    }

    pub fn dmem(&self, addr: usize) -> Option<u32> {
        self.dmem.get(addr).copied()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Accumulated `sync`/`synci` offset.
    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Runs until `end`.
    pub fn run(&mut self) -> Result<(), EmulatorError> {
        while !self.halted {
            self.step()?;
        }
        Ok(())
    }

    /// Executes one instruction.
    ///
    /// # Returns
    ///
    /// `Ok(true)` while the program keeps running, `Ok(false)` once `end` was
    /// executed.
    pub fn step(&mut self) -> Result<bool, EmulatorError> {
        if self.halted {
            return Ok(false);
        }
        if self.steps >= self.step_limit {
            return Err(EmulatorError::StepLimit(self.step_limit));
        }
        let pc = self.pc;
        let word = *self
            .words
            .get(pc)
            .ok_or(EmulatorError::PcOutOfRange(pc))?;
        let decoded = isa::decode(word).ok_or(EmulatorError::InvalidOpcode { pc, word })?;
        self.steps += 1;
        self.pc = self.execute(pc, &decoded)?;
        Ok(!self.halted)
    }

    fn execute(&mut self, pc: usize, d: &Decoded) -> Result<usize, EmulatorError> {
        let o = &d.operands;
        let m = d.mnemonic;
        let next = pc + 1;
        let page = o[0] as u8;

        match m {
            Mnemonic::Regwi => self.write(page, o[1], imm(o[2])),
            Mnemonic::Mathi => {
                let v = arith(pc, m, o[3], self.read(page, o[2]), imm(o[4]))?;
                self.write(page, o[1], v);
            }
            Mnemonic::Math => {
                let v = arith(pc, m, o[3], self.read(page, o[2]), self.read(page, o[4]))?;
                self.write(page, o[1], v);
            }
            Mnemonic::Bitwi => {
                let v = bitwise(pc, m, o[3], self.read(page, o[2]), imm(o[4]))?;
                self.write(page, o[1], v);
            }
            Mnemonic::Bitw => {
                let v = bitwise(pc, m, o[3], self.read(page, o[2]), self.read(page, o[4]))?;
                self.write(page, o[1], v);
            }
            Mnemonic::Memwi => {
                let value = self.read(page, o[1]);
                *self.dmem_slot(pc, o[2])? = value;
            }
            Mnemonic::Memri => {
                let value = *self.dmem_slot(pc, o[2])?;
                self.write(page, o[1], value);
            }
            Mnemonic::Memw => {
                let value = self.read(page, o[1]);
                let addr = u64::from(self.read(page, o[2]));
                *self.dmem_slot(pc, addr)? = value;
            }
            Mnemonic::Memr => {
                let addr = u64::from(self.read(page, o[2]));
                let value = *self.dmem_slot(pc, addr)?;
                self.write(page, o[1], value);
            }
            Mnemonic::Loopnz => {
                let count = self.read(page, o[1]);
                if count != 0 {
                    self.write(page, o[1], count - 1);
                    return Ok(o[2] as usize);
                }
            }
            Mnemonic::Condj => {
                let lhs = self.read(page, o[1]) as i32;
                let rhs = self.read(page, o[3]) as i32;
                if compare(pc, m, o[2], lhs, rhs)? {
                    return Ok(o[4] as usize);
                }
            }
            Mnemonic::End => self.halted = true,
            Mnemonic::Set => {
                let page = o[1] as u8;
                let event = Event::Set {
                    ch: o[0] as u8,
                    time: i64::from(self.read(page, o[7])) + self.time_offset,
                    freq: self.read(page, o[2]),
                    phase: self.read(page, o[3]),
                    addr: self.read(page, o[4]),
                    gain: self.read(page, o[5]),
                    mode: self.read(page, o[6]),
                };
                self.events.push(event);
            }
            Mnemonic::Seti => {
                let event = Event::Seti {
                    ch: o[0] as u8,
                    time: immediate_value(o[3]) + self.time_offset,
                    value: self.read(o[1] as u8, o[2]),
                };
                self.events.push(event);
            }
            Mnemonic::Synci => self.time_offset += immediate_value(o[0]),
            Mnemonic::Sync => self.time_offset += i64::from(self.read(page, o[1])),
            Mnemonic::Waiti | Mnemonic::Wait => {}
            Mnemonic::Setbi
            | Mnemonic::Setb
            | Mnemonic::Pushi
            | Mnemonic::Popi
            | Mnemonic::Read => return Err(EmulatorError::Unsupported { pc, mnemonic: m }),
        }
        Ok(next)
    }

    fn read(&self, page: u8, reg: u64) -> u32 {
        self.reg(page, reg as u8)
    }

    fn write(&mut self, page: u8, reg: u64, value: u32) {
        if reg != 0 {
            self.regs[page as usize % NUM_PAGES as usize][reg as usize % REGS_PER_PAGE as usize] =
                value;
        }
    }

    fn dmem_slot(&mut self, pc: usize, addr: u64) -> Result<&mut u32, EmulatorError> {
        self.dmem
            .get_mut(addr as usize)
            .ok_or(EmulatorError::DmemOutOfRange { pc, addr })
    }
}

/// Register value of a sign-extended immediate.
fn imm(raw: u64) -> u32 {
    immediate_value(raw) as u32
}

fn arith(pc: usize, mnemonic: Mnemonic, code: u64, a: u32, b: u32) -> Result<u32, EmulatorError> {
    match code {
        0b1000 => Ok(a.wrapping_add(b)),
        0b1001 => Ok(a.wrapping_sub(b)),
        0b1010 => Ok(a.wrapping_mul(b)),
        _ => Err(invalid_operator(pc, mnemonic, code)),
    }
}

fn bitwise(pc: usize, mnemonic: Mnemonic, code: u64, a: u32, b: u32) -> Result<u32, EmulatorError> {
    match code {
        0b0000 => Ok(a & b),
        0b0001 => Ok(a | b),
        0b0010 => Ok(a ^ b),
        0b0011 => Ok(!b),
        0b0100 => Ok(a.checked_shl(b).unwrap_or(0)),
        0b0101 => Ok(a.checked_shr(b).unwrap_or(0)),
        _ => Err(invalid_operator(pc, mnemonic, code)),
    }
}

fn compare(pc: usize, mnemonic: Mnemonic, code: u64, a: i32, b: i32) -> Result<bool, EmulatorError> {
    match code {
        0b0000 => Ok(a > b),
        0b0001 => Ok(a >= b),
        0b0010 => Ok(a < b),
        0b0011 => Ok(a <= b),
        0b0100 => Ok(a == b),
        0b0101 => Ok(a != b),
        _ => Err(invalid_operator(pc, mnemonic, code)),
    }
}

fn invalid_operator(pc: usize, mnemonic: Mnemonic, code: u64) -> EmulatorError {
    EmulatorError::InvalidOperator {
        pc,
        mnemonic,
        code: code as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;

    fn run(prog: &Program) -> Emulator {
        let mut vm = Emulator::new(prog.encode().unwrap());
        vm.run().unwrap();
        vm
    }

    #[test]
    fn loopnz_body_runs_preload_plus_one_times() {
        let mut prog = Program::new();
        prog.regwi(0, 1, 0);
        prog.regwi(0, 2, 4);
        prog.define_label("LOOP").unwrap();
        prog.mathi(0, 1, 1, "+", 1);
        prog.loopnz(0, 2, "LOOP");
        prog.end();

        let vm = run(&prog);
        assert_eq!(vm.reg(0, 1), 5);
        assert_eq!(vm.reg(0, 2), 0);
    }

    #[test]
    fn register_zero_stays_zero() {
        let mut prog = Program::new();
        prog.regwi(3, 0, 99);
        prog.mathi(3, 5, 0, "+", 7);
        prog.end();

        let vm = run(&prog);
        assert_eq!(vm.reg(3, 0), 0);
        assert_eq!(vm.reg(3, 5), 7);
    }

    #[test]
    fn pages_are_independent() {
        let mut prog = Program::new();
        prog.regwi(0, 4, 1);
        prog.regwi(1, 4, 2);
        prog.end();

        let vm = run(&prog);
        assert_eq!(vm.reg(0, 4), 1);
        assert_eq!(vm.reg(1, 4), 2);
    }

    #[test]
    fn negative_immediates_and_bitwise_ops() {
        let mut prog = Program::new();
        prog.regwi(0, 1, -1);
        prog.bitwi(0, 2, 1, "&", 0xFF);
        prog.bitwi(0, 3, 2, "<<", 4);
        prog.bitwi(0, 4, 1, ">>", 28);
        prog.end();

        let vm = run(&prog);
        assert_eq!(vm.reg(0, 1), u32::MAX);
        assert_eq!(vm.reg(0, 2), 0xFF);
        assert_eq!(vm.reg(0, 3), 0xFF0);
        assert_eq!(vm.reg(0, 4), 0xF);
    }

    #[test]
    fn safe_regwi_loads_full_width_constants() {
        for value in [0xFFFF_FFFFi64, 1 << 30, 0x8000_0001, -(1 << 30) - 5] {
            let mut prog = Program::new();
            prog.safe_regwi(0, 16, value, None);
            prog.end();
            let vm = run(&prog);
            assert_eq!(vm.reg(0, 16), value as u32, "{value:#x}");
        }
    }

    #[test]
    fn memwi_publishes_to_data_memory() {
        let mut prog = Program::new();
        prog.regwi(0, 13, 42);
        prog.memwi(0, 13, 1);
        prog.memri(0, 14, 1);
        prog.end();

        let vm = run(&prog);
        assert_eq!(vm.dmem(1), Some(42));
        assert_eq!(vm.reg(0, 14), 42);
    }

    #[test]
    fn condj_skips_when_comparison_holds() {
        let mut prog = Program::new();
        prog.regwi(0, 1, 3);
        prog.regwi(0, 2, 3);
        prog.condj(0, 1, "==", 2, "DONE");
        prog.regwi(0, 5, 1);
        prog.define_label("DONE").unwrap();
        prog.end();

        let vm = run(&prog);
        assert_eq!(vm.reg(0, 5), 0);
    }

    #[test]
    fn seti_time_includes_sync_offset() {
        let mut prog = Program::new();
        prog.regwi(0, 31, 1);
        prog.seti(7, 0, 31, 10);
        prog.synci(100);
        prog.seti(7, 0, 31, 10);
        prog.end();

        let vm = run(&prog);
        let times: Vec<i64> = vm.events().iter().map(Event::time).collect();
        assert_eq!(times, vec![10, 110]);
        assert_eq!(vm.time_offset(), 100);
    }

    #[test]
    fn runaway_program_hits_step_limit() {
        let mut prog = Program::new();
        prog.define_label("SPIN").unwrap();
        prog.condj(0, 0, "==", 0, "SPIN");

        let mut vm = Emulator::new(prog.encode().unwrap()).with_step_limit(50);
        assert_eq!(vm.run(), Err(EmulatorError::StepLimit(50)));
        assert_eq!(vm.steps(), 50);
    }

    #[test]
    fn falling_off_the_end_is_an_error() {
        let mut prog = Program::new();
        prog.regwi(0, 1, 1);
        let mut vm = Emulator::new(prog.encode().unwrap());
        assert_eq!(vm.run(), Err(EmulatorError::PcOutOfRange(1)));
    }

    #[test]
    fn data_memory_bounds_are_checked() {
        let mut prog = Program::new();
        prog.memwi(0, 1, DMEM_DEPTH as i64);
        let mut vm = Emulator::new(prog.encode().unwrap());
        assert!(matches!(
            vm.run(),
            Err(EmulatorError::DmemOutOfRange { pc: 0, .. })
        ));
    }
}
