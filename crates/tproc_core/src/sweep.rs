use crate::bit_utils::FieldPack;
use crate::channels::{REGISTER_WIDTH, RegisterAddr};
use crate::program::Program;
use crate::{AssemblyError, Result};
use serde::{Deserialize, Serialize};
use tproc_common::isa::Operator;
use tracing::debug;

fn full_width() -> u32 {
    REGISTER_WIDTH
}

/// A register stepped once per loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweptRegister {
    pub addr: RegisterAddr,
    pub start: i64,
    pub step: i64,
    /// Effective width of the swept value; the register is kept modulo
    /// `2^width`, the way the hardware field consuming it truncates.
    #[serde(default = "full_width")]
    pub width: u32,
}

impl SweptRegister {
    pub fn new(addr: RegisterAddr, start: i64, step: i64) -> Self {
        Self {
            addr,
            start,
            step,
            width: REGISTER_WIDTH,
        }
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = width.clamp(1, REGISTER_WIDTH);
        self
    }

    /// Register value during iteration `i`.
    pub fn value(&self, i: u32) -> u32 {
        FieldPack::wrap(self.start + i64::from(i) * self.step, self.width) as u32
    }
}

/// A counted loop over zero or more swept registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepDescriptor {
    /// Loop name; also the label of the loop's first body instruction.
    pub name: String,
    pub count: u32,
    /// Register decremented by `loopnz`.
    pub counter: RegisterAddr,
    #[serde(default)]
    pub registers: Vec<SweptRegister>,
}

impl SweepDescriptor {
    pub fn new(name: impl Into<String>, count: u32, counter: RegisterAddr) -> Self {
        Self {
            name: name.into(),
            count,
            counter,
            registers: Vec::new(),
        }
    }

    pub fn sweep(mut self, register: SweptRegister) -> Self {
        self.registers.push(register);
        self
    }

    /// Values taken by swept register `index` over the whole loop.
    pub fn values(&self, index: usize) -> Vec<u32> {
        self.registers
            .get(index)
            .map(|r| (0..self.count).map(|i| r.value(i)).collect())
            .unwrap_or_default()
    }
}

/// Expands sweep descriptors into nested counted loops.
///
/// Each loop compiles to: preload of every swept register and of the
/// counter (`count - 1`), the loop label, the body, one increment per swept
/// register, and a `loopnz` back to the label. The counter and swept
/// registers stay live for the whole body; a nested sweep touching any of
/// them is rejected.
pub struct SweepGenerator<'p> {
    prog: &'p mut Program,
    live: Vec<(RegisterAddr, String)>,
}

impl<'p> SweepGenerator<'p> {
    pub fn new(prog: &'p mut Program) -> Self {
        Self {
            prog,
            live: Vec::new(),
        }
    }

    pub fn program(&mut self) -> &mut Program {
        self.prog
    }

    /// Registers currently owned by an enclosing loop or reservation.
    pub fn live_registers(&self) -> impl Iterator<Item = RegisterAddr> + '_ {
        self.live.iter().map(|(addr, _)| *addr)
    }

    /// Marks a register as live for the rest of the generator's lifetime.
    pub fn reserve(&mut self, addr: RegisterAddr, owner: impl Into<String>) -> Result<()> {
        let owner = owner.into();
        self.check_free(addr)?;
        self.live.push((addr, owner));
        Ok(())
    }

    /// Emits a loop for `desc` around the code produced by `body`.
    ///
    /// # Arguments
    ///
    /// * `desc` - Loop name, trip count, counter and swept registers
    /// * `body` - Emits the loop body; may open nested sweeps on the same
    ///   generator
    ///
    /// # Returns
    ///
    /// `InvalidSweepCount` for a zero trip count, `RegisterCollision` when a
    /// register is already live or used twice by `desc`, `DuplicateLabel`
    /// when the loop name is taken, or any error raised by `body`. On error
    /// the program is left as it was before the call.
    pub fn sweep<F>(&mut self, desc: &SweepDescriptor, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if desc.count == 0 {
            return Err(AssemblyError::InvalidSweepCount {
                name: desc.name.clone(),
                count: desc.count,
            });
        }

        let mark = self.live.len();
        let checkpoint = self.prog.checkpoint();
        let owned = std::iter::once(desc.counter).chain(desc.registers.iter().map(|r| r.addr));
        for addr in owned {
            if let Err(e) = self.reserve(addr, desc.name.as_str()) {
                self.live.truncate(mark);
                return Err(e);
            }
        }

        debug!(
            sweep = %desc.name,
            count = desc.count,
            registers = desc.registers.len(),
            depth = mark,
            "opening loop"
        );

        for r in &desc.registers {
            let start = FieldPack::wrap(r.start, r.width) as i64;
            let comment = format!("{}: {} = {}", desc.name, r.addr, r.start);
            self.prog
                .safe_regwi(r.addr.page, r.addr.reg, start, Some(comment.as_str()));
        }
        let comment = format!("{}: {} iterations", desc.name, desc.count);
        self.prog.safe_regwi(
            desc.counter.page,
            desc.counter.reg,
            i64::from(desc.count - 1),
            Some(comment.as_str()),
        );

        // A failed loop leaves the program as it was on entry.
        let result = match self.prog.define_label(desc.name.as_str()) {
            Ok(()) => body(self),
            Err(e) => Err(e),
        };
        self.live.truncate(mark);
        if let Err(e) = result {
            self.prog.rollback(checkpoint);
            return Err(e);
        }

        for r in &desc.registers {
            let RegisterAddr { page, reg } = r.addr;
            self.prog.mathi(page, reg, reg, Operator::Add, r.step);
            match r.width {
                w if w >= REGISTER_WIDTH => {}
                // The mask would not fit a sign-extended immediate.
                31 => {
                    self.prog.bitwi(page, reg, reg, Operator::Shl, 1);
                    self.prog.bitwi(page, reg, reg, Operator::Shr, 1);
                }
                w => {
                    self.prog
                        .bitwi(page, reg, reg, Operator::And, (1i64 << w) - 1);
                }
            }
        }
        self.prog
            .loopnz(desc.counter.page, desc.counter.reg, desc.name.as_str());
        Ok(())
    }

    fn check_free(&self, addr: RegisterAddr) -> Result<()> {
        let collision = |owner: &str| AssemblyError::RegisterCollision {
            page: addr.page,
            reg: addr.reg,
            owner: owner.to_string(),
        };
        if addr.reg == 0 {
            return Err(collision("zero register"));
        }
        match self.live.iter().find(|(live, _)| *live == addr) {
            Some((_, holder)) => Err(collision(holder)),
            None => Ok(()),
        }
    }
}
