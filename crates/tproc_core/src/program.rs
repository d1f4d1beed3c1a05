//! Program assembler.
//!
//! A [`Program`] is an ordered list of typed [`Instruction`]s plus a label
//! table. Building is append-only; encoding is a pure function of the current
//! instructions and labels, so a program can be encoded, extended and encoded
//! again. Labels may be referenced before they are defined and are resolved
//! at encode time.

use crate::bit_utils::FieldPack;
use crate::{AssemblyError, Result};
use indexmap::IndexMap;
use std::fmt;
use tproc_common::isa::{FieldKind, MAX_OPERANDS, Mnemonic, OPCODE_SHIFT, Operator};

/// Operator operand: either already typed, or a symbol resolved at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRef {
    Known(Operator),
    Symbol(String),
}

impl OpRef {
    pub fn resolve(&self) -> Result<Operator> {
        match self {
            OpRef::Known(op) => Ok(*op),
            OpRef::Symbol(sym) => sym
                .parse()
                .map_err(|_| AssemblyError::UnknownOperator(sym.clone())),
        }
    }
}

impl From<Operator> for OpRef {
    fn from(op: Operator) -> Self {
        OpRef::Known(op)
    }
}

impl From<&str> for OpRef {
    fn from(sym: &str) -> Self {
        OpRef::Symbol(sym.to_string())
    }
}

impl From<String> for OpRef {
    fn from(sym: String) -> Self {
        OpRef::Symbol(sym)
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpRef::Known(op) => f.write_str(op.symbol()),
            OpRef::Symbol(sym) => f.write_str(sym),
        }
    }
}

/// Untyped operand, as produced by a text parser or consumed by the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Page, channel or immediate value.
    Int(i64),
    /// Register number.
    Reg(u8),
    /// Jump target.
    Label(String),
    Op(OpRef),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Int(v) => write!(f, "{v}"),
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Label(name) => f.write_str(name),
            Operand::Op(op) => write!(f, "{op}"),
        }
    }
}

/// One tProc instruction with its typed operands.
///
/// Register fields (`dst`, `src`, ...) name registers on `page`. Immediates
/// are signed; see [`FieldPack::fit`] for the accepted range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Pushi { page: u8, dst: u8, src: u8, imm: i64 },
    Popi { page: u8, reg: u8 },
    Mathi { page: u8, dst: u8, src: u8, op: OpRef, imm: i64 },
    Seti { ch: u8, page: u8, reg: u8, t: i64 },
    Synci { t: i64 },
    Waiti { ch: u8, t: i64 },
    Bitwi { page: u8, dst: u8, src: u8, op: OpRef, imm: i64 },
    Memri { page: u8, reg: u8, addr: i64 },
    Memwi { page: u8, reg: u8, addr: i64 },
    Regwi { page: u8, reg: u8, imm: i64 },
    Setbi { page: u8, reg: u8, imm: i64 },
    Loopnz { page: u8, reg: u8, target: String },
    Condj { page: u8, lhs: u8, op: OpRef, rhs: u8, target: String },
    End,
    Math { page: u8, dst: u8, lhs: u8, op: OpRef, rhs: u8 },
    Set {
        ch: u8,
        page: u8,
        freq: u8,
        phase: u8,
        addr: u8,
        gain: u8,
        mode: u8,
        t: u8,
    },
    Sync { page: u8, reg: u8 },
    Read { ch: u8, page: u8, op: OpRef, reg: u8 },
    Wait { ch: u8, page: u8, reg: u8 },
    Bitw { page: u8, dst: u8, lhs: u8, op: OpRef, rhs: u8 },
    Memr { page: u8, dst: u8, addr: u8 },
    Memw { page: u8, src: u8, addr: u8 },
    Setb { page: u8, src: u8, addr: u8 },
}

fn int(v: impl Into<i64>) -> Operand {
    Operand::Int(v.into())
}

fn reg(r: u8) -> Operand {
    Operand::Reg(r)
}

impl Instruction {
    pub fn mnemonic(&self) -> Mnemonic {
        match self {
            Instruction::Pushi { .. } => Mnemonic::Pushi,
            Instruction::Popi { .. } => Mnemonic::Popi,
            Instruction::Mathi { .. } => Mnemonic::Mathi,
            Instruction::Seti { .. } => Mnemonic::Seti,
            Instruction::Synci { .. } => Mnemonic::Synci,
            Instruction::Waiti { .. } => Mnemonic::Waiti,
            Instruction::Bitwi { .. } => Mnemonic::Bitwi,
            Instruction::Memri { .. } => Mnemonic::Memri,
            Instruction::Memwi { .. } => Mnemonic::Memwi,
            Instruction::Regwi { .. } => Mnemonic::Regwi,
            Instruction::Setbi { .. } => Mnemonic::Setbi,
            Instruction::Loopnz { .. } => Mnemonic::Loopnz,
            Instruction::Condj { .. } => Mnemonic::Condj,
            Instruction::End => Mnemonic::End,
            Instruction::Math { .. } => Mnemonic::Math,
            Instruction::Set { .. } => Mnemonic::Set,
            Instruction::Sync { .. } => Mnemonic::Sync,
            Instruction::Read { .. } => Mnemonic::Read,
            Instruction::Wait { .. } => Mnemonic::Wait,
            Instruction::Bitw { .. } => Mnemonic::Bitw,
            Instruction::Memr { .. } => Mnemonic::Memr,
            Instruction::Memw { .. } => Mnemonic::Memw,
            Instruction::Setb { .. } => Mnemonic::Setb,
        }
    }

    /// Operands in the order of the mnemonic's operand list.
    pub fn operands(&self) -> Vec<Operand> {
        let op = |o: &OpRef| Operand::Op(o.clone());
        let label = |t: &String| Operand::Label(t.clone());
        match self {
            Instruction::Pushi { page, dst, src, imm } => {
                vec![int(*page), reg(*dst), reg(*src), int(*imm)]
            }
            Instruction::Popi { page, reg: r } => vec![int(*page), reg(*r)],
            Instruction::Mathi {
                page,
                dst,
                src,
                op: o,
                imm,
            }
            | Instruction::Bitwi {
                page,
                dst,
                src,
                op: o,
                imm,
            } => vec![int(*page), reg(*dst), reg(*src), op(o), int(*imm)],
            Instruction::Seti { ch, page, reg: r, t } => {
                vec![int(*ch), int(*page), reg(*r), int(*t)]
            }
            Instruction::Synci { t } => vec![int(*t)],
            Instruction::Waiti { ch, t } => vec![int(*ch), int(*t)],
            Instruction::Memri { page, reg: r, addr } | Instruction::Memwi { page, reg: r, addr } => {
                vec![int(*page), reg(*r), int(*addr)]
            }
            Instruction::Regwi { page, reg: r, imm } | Instruction::Setbi { page, reg: r, imm } => {
                vec![int(*page), reg(*r), int(*imm)]
            }
            Instruction::Loopnz { page, reg: r, target } => {
                vec![int(*page), reg(*r), label(target)]
            }
            Instruction::Condj {
                page,
                lhs,
                op: o,
                rhs,
                target,
            } => vec![int(*page), reg(*lhs), op(o), reg(*rhs), label(target)],
            Instruction::End => Vec::new(),
            Instruction::Math {
                page,
                dst,
                lhs,
                op: o,
                rhs,
            }
            | Instruction::Bitw {
                page,
                dst,
                lhs,
                op: o,
                rhs,
            } => vec![int(*page), reg(*dst), reg(*lhs), op(o), reg(*rhs)],
            Instruction::Set {
                ch,
                page,
                freq,
                phase,
                addr,
                gain,
                mode,
                t,
            } => vec![
                int(*ch),
                int(*page),
                reg(*freq),
                reg(*phase),
                reg(*addr),
                reg(*gain),
                reg(*mode),
                reg(*t),
            ],
            Instruction::Sync { page, reg: r } => vec![int(*page), reg(*r)],
            Instruction::Read {
                ch,
                page,
                op: o,
                reg: r,
            } => vec![int(*ch), int(*page), op(o), reg(*r)],
            Instruction::Wait { ch, page, reg: r } => vec![int(*ch), int(*page), reg(*r)],
            Instruction::Memr { page, dst, addr } => vec![int(*page), reg(*dst), reg(*addr)],
            Instruction::Memw { page, src, addr } | Instruction::Setb { page, src, addr } => {
                vec![int(*page), reg(*src), reg(*addr)]
            }
        }
    }

    /// Jump target label, for the two branching mnemonics.
    pub fn target(&self) -> Option<&str> {
        match self {
            Instruction::Loopnz { target, .. } | Instruction::Condj { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }

    /// Builds a typed instruction from a mnemonic name and raw operands.
    pub fn parse_parts(name: &str, operands: Vec<Operand>) -> Result<Self> {
        let mnemonic = name
            .parse::<Mnemonic>()
            .map_err(|_| AssemblyError::UnknownMnemonic(name.to_string()))?;
        Self::from_parts(mnemonic, operands)
    }

    /// Builds a typed instruction from raw operands.
    ///
    /// Checks the operand count and that every operand has the kind its
    /// field expects. Value ranges are checked later, at encode time.
    pub fn from_parts(mnemonic: Mnemonic, operands: Vec<Operand>) -> Result<Self> {
        let expected = mnemonic.def().arity();
        if operands.len() != expected {
            return Err(AssemblyError::OperandCount {
                mnemonic,
                expected,
                found: operands.len(),
            });
        }
        let a = Args {
            mnemonic,
            items: operands,
        };

        let instruction = match mnemonic {
            Mnemonic::Pushi => Instruction::Pushi {
                page: a.small(0)?,
                dst: a.reg(1)?,
                src: a.reg(2)?,
                imm: a.int(3)?,
            },
            Mnemonic::Popi => Instruction::Popi {
                page: a.small(0)?,
                reg: a.reg(1)?,
            },
            Mnemonic::Mathi => Instruction::Mathi {
                page: a.small(0)?,
                dst: a.reg(1)?,
                src: a.reg(2)?,
                op: a.op(3)?,
                imm: a.int(4)?,
            },
            Mnemonic::Seti => Instruction::Seti {
                ch: a.small(0)?,
                page: a.small(1)?,
                reg: a.reg(2)?,
                t: a.int(3)?,
            },
            Mnemonic::Synci => Instruction::Synci { t: a.int(0)? },
            Mnemonic::Waiti => Instruction::Waiti {
                ch: a.small(0)?,
                t: a.int(1)?,
            },
            Mnemonic::Bitwi => Instruction::Bitwi {
                page: a.small(0)?,
                dst: a.reg(1)?,
                src: a.reg(2)?,
                op: a.op(3)?,
                imm: a.int(4)?,
            },
            Mnemonic::Memri => Instruction::Memri {
                page: a.small(0)?,
                reg: a.reg(1)?,
                addr: a.int(2)?,
            },
            Mnemonic::Memwi => Instruction::Memwi {
                page: a.small(0)?,
                reg: a.reg(1)?,
                addr: a.int(2)?,
            },
            Mnemonic::Regwi => Instruction::Regwi {
                page: a.small(0)?,
                reg: a.reg(1)?,
                imm: a.int(2)?,
            },
            Mnemonic::Setbi => Instruction::Setbi {
                page: a.small(0)?,
                reg: a.reg(1)?,
                imm: a.int(2)?,
            },
            Mnemonic::Loopnz => Instruction::Loopnz {
                page: a.small(0)?,
                reg: a.reg(1)?,
                target: a.label(2)?,
            },
            Mnemonic::Condj => Instruction::Condj {
                page: a.small(0)?,
                lhs: a.reg(1)?,
                op: a.op(2)?,
                rhs: a.reg(3)?,
                target: a.label(4)?,
            },
            Mnemonic::End => Instruction::End,
            Mnemonic::Math => Instruction::Math {
                page: a.small(0)?,
                dst: a.reg(1)?,
                lhs: a.reg(2)?,
                op: a.op(3)?,
                rhs: a.reg(4)?,
            },
            Mnemonic::Set => Instruction::Set {
                ch: a.small(0)?,
                page: a.small(1)?,
                freq: a.reg(2)?,
                phase: a.reg(3)?,
                addr: a.reg(4)?,
                gain: a.reg(5)?,
                mode: a.reg(6)?,
                t: a.reg(7)?,
            },
            Mnemonic::Sync => Instruction::Sync {
                page: a.small(0)?,
                reg: a.reg(1)?,
            },
            Mnemonic::Read => Instruction::Read {
                ch: a.small(0)?,
                page: a.small(1)?,
                op: a.op(2)?,
                reg: a.reg(3)?,
            },
            Mnemonic::Wait => Instruction::Wait {
                ch: a.small(0)?,
                page: a.small(1)?,
                reg: a.reg(2)?,
            },
            Mnemonic::Bitw => Instruction::Bitw {
                page: a.small(0)?,
                dst: a.reg(1)?,
                lhs: a.reg(2)?,
                op: a.op(3)?,
                rhs: a.reg(4)?,
            },
            Mnemonic::Memr => Instruction::Memr {
                page: a.small(0)?,
                dst: a.reg(1)?,
                addr: a.reg(2)?,
            },
            Mnemonic::Memw => Instruction::Memw {
                page: a.small(0)?,
                src: a.reg(1)?,
                addr: a.reg(2)?,
            },
            Mnemonic::Setb => Instruction::Setb {
                page: a.small(0)?,
                src: a.reg(1)?,
                addr: a.reg(2)?,
            },
        };
        Ok(instruction)
    }
}

struct Args {
    mnemonic: Mnemonic,
    items: Vec<Operand>,
}

impl Args {
    fn expected(&self, index: usize) -> FieldKind {
        self.mnemonic
            .def()
            .operand_kind(index)
            .unwrap_or(FieldKind::Immediate)
    }

    fn kind_error(&self, index: usize) -> AssemblyError {
        AssemblyError::OperandKind {
            mnemonic: self.mnemonic,
            index,
            expected: self.expected(index),
        }
    }

    fn int(&self, index: usize) -> Result<i64> {
        match &self.items[index] {
            Operand::Int(v) => Ok(*v),
            _ => Err(self.kind_error(index)),
        }
    }

    /// Page or channel number.
    fn small(&self, index: usize) -> Result<u8> {
        let value = self.int(index)?;
        u8::try_from(value).map_err(|_| AssemblyError::FieldOverflow {
            mnemonic: self.mnemonic,
            operand_index: index,
            value,
            width: self.expected(index).width(),
        })
    }

    fn reg(&self, index: usize) -> Result<u8> {
        match &self.items[index] {
            Operand::Reg(r) => Ok(*r),
            _ => Err(self.kind_error(index)),
        }
    }

    fn op(&self, index: usize) -> Result<OpRef> {
        match &self.items[index] {
            Operand::Op(op) => Ok(op.clone()),
            _ => Err(self.kind_error(index)),
        }
    }

    fn label(&self, index: usize) -> Result<String> {
        match &self.items[index] {
            Operand::Label(name) => Ok(name.clone()),
            _ => Err(self.kind_error(index)),
        }
    }
}

/// An instruction with its optional listing comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub instruction: Instruction,
    pub comment: Option<String>,
}

fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn one_line(comment: String) -> String {
    if comment.contains(['\n', '\r']) {
        comment.replace(['\n', '\r'], " ")
    } else {
        comment
    }
}

/// Program length and label count at some point of construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Checkpoint {
    statements: usize,
    labels: usize,
}

/// Ordered instruction list plus label table.
#[derive(Debug, Clone, Default)]
pub struct Program {
    statements: Vec<Statement>,
    labels: IndexMap<String, usize>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Labels in definition order, with the program counter they mark.
    pub fn labels(&self) -> impl Iterator<Item = (&str, usize)> {
        self.labels.iter().map(|(name, &pc)| (name.as_str(), pc))
    }

    pub fn label_pc(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Appends an instruction and returns its program counter.
    pub fn append(&mut self, instruction: Instruction) -> usize {
        self.push(instruction, None)
    }

    /// Appends an instruction with a listing comment. Line breaks in the
    /// comment are folded into spaces so the listing stays one line per
    /// instruction.
    pub fn append_with_comment(
        &mut self,
        instruction: Instruction,
        comment: impl Into<String>,
    ) -> usize {
        self.push(instruction, Some(one_line(comment.into())))
    }

    fn push(&mut self, instruction: Instruction, comment: Option<String>) -> usize {
        let pc = self.statements.len();
        self.statements.push(Statement {
            instruction,
            comment,
        });
        pc
    }

    /// Binds `name` to the program counter of the next appended instruction.
    ///
    /// Names follow the listing identifier rule `[A-Za-z_][A-Za-z0-9_]*`.
    pub fn define_label(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if !is_label_name(&name) {
            return Err(AssemblyError::InvalidLabel(name));
        }
        if self.labels.contains_key(&name) {
            return Err(AssemblyError::DuplicateLabel(name));
        }
        self.labels.insert(name, self.statements.len());
        Ok(())
    }

    /// Current end of the program, for [`Program::rollback`].
    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            statements: self.statements.len(),
            labels: self.labels.len(),
        }
    }

    /// Drops every instruction and label added after `mark`.
    pub(crate) fn rollback(&mut self, mark: Checkpoint) {
        self.statements.truncate(mark.statements);
        self.labels.truncate(mark.labels);
    }

    /// Encodes every instruction into its 64-bit word.
    ///
    /// Fails on the first unresolved label, unknown operator or operand that
    /// does not fit its field. Encoding does not modify the program.
    pub fn encode(&self) -> Result<Vec<u64>> {
        self.statements
            .iter()
            .enumerate()
            .map(|(pc, stmt)| self.encode_instruction(pc, &stmt.instruction))
            .collect()
    }

    /// Encodes a single instruction against this program's label table.
    pub fn encode_instruction(&self, pc: usize, instruction: &Instruction) -> Result<u64> {
        let mnemonic = instruction.mnemonic();
        let def = mnemonic.def();

        let mut values = [0u64; MAX_OPERANDS];
        for (index, operand) in instruction.operands().iter().enumerate() {
            let value = match operand {
                Operand::Int(v) => *v,
                Operand::Reg(r) => i64::from(*r),
                Operand::Label(name) => {
                    let target =
                        self.label_pc(name)
                            .ok_or_else(|| AssemblyError::UnresolvedLabel {
                                label: name.clone(),
                                pc,
                                mnemonic,
                            })?;
                    target as i64
                }
                Operand::Op(op) => i64::from(op.resolve()?.code()),
            };
            let kind = def
                .operand_kind(index)
                .ok_or(AssemblyError::OperandCount {
                    mnemonic,
                    expected: def.arity(),
                    found: index + 1,
                })?;
            values[index] =
                FieldPack::fit(value, kind).ok_or(AssemblyError::FieldOverflow {
                    mnemonic,
                    operand_index: index,
                    value,
                    width: kind.width(),
                })?;
        }

        let mut word = (u64::from(def.opcode) << OPCODE_SHIFT) | def.marker;
        for field in def.fields {
            word |= FieldPack::place(values[field.operand], field);
        }
        Ok(word)
    }

    /// One `0x`-prefixed hexadecimal word per line.
    pub fn hex(&self) -> Result<String> {
        Ok(self
            .encode()?
            .iter()
            .map(|w| format!("{w:#018x}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// One `0b`-prefixed 64-digit binary word per line.
    pub fn bin(&self) -> Result<String> {
        Ok(self
            .encode()?
            .iter()
            .map(|w| format!("{w:#066b}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Assembly listing, accepted back by the text parser.
    pub fn asm(&self) -> String {
        self.to_string()
    }

    pub fn regwi(&mut self, page: u8, reg: u8, imm: i64) -> usize {
        self.append(Instruction::Regwi { page, reg, imm })
    }

    /// Writes a full 32-bit constant into a register.
    ///
    /// `regwi` sign-extends its 31-bit immediate, so values with magnitude of
    /// `2^30` or more are loaded as `v >> 2`, shifted left by two and
    /// completed with the remaining low bits.
    pub fn safe_regwi(&mut self, page: u8, reg: u8, imm: i64, comment: Option<&str>) -> usize {
        let first = if imm.abs() < 1 << 30 {
            self.append(Instruction::Regwi { page, reg, imm })
        } else {
            let pc = self.regwi(page, reg, imm >> 2);
            self.bitwi(page, reg, reg, Operator::Shl, 2);
            let low = imm.rem_euclid(4);
            if low != 0 {
                self.mathi(page, reg, reg, Operator::Add, low);
            }
            pc
        };
        if let Some(comment) = comment {
            self.statements[first].comment = Some(one_line(comment.to_string()));
        }
        first
    }

    pub fn mathi(&mut self, page: u8, dst: u8, src: u8, op: impl Into<OpRef>, imm: i64) -> usize {
        self.append(Instruction::Mathi {
            page,
            dst,
            src,
            op: op.into(),
            imm,
        })
    }

    pub fn math(&mut self, page: u8, dst: u8, lhs: u8, op: impl Into<OpRef>, rhs: u8) -> usize {
        self.append(Instruction::Math {
            page,
            dst,
            lhs,
            op: op.into(),
            rhs,
        })
    }

    pub fn bitwi(&mut self, page: u8, dst: u8, src: u8, op: impl Into<OpRef>, imm: i64) -> usize {
        self.append(Instruction::Bitwi {
            page,
            dst,
            src,
            op: op.into(),
            imm,
        })
    }

    pub fn memwi(&mut self, page: u8, reg: u8, addr: i64) -> usize {
        self.append(Instruction::Memwi { page, reg, addr })
    }

    pub fn memri(&mut self, page: u8, reg: u8, addr: i64) -> usize {
        self.append(Instruction::Memri { page, reg, addr })
    }

    pub fn loopnz(&mut self, page: u8, reg: u8, target: impl Into<String>) -> usize {
        self.append(Instruction::Loopnz {
            page,
            reg,
            target: target.into(),
        })
    }

    pub fn condj(
        &mut self,
        page: u8,
        lhs: u8,
        op: impl Into<OpRef>,
        rhs: u8,
        target: impl Into<String>,
    ) -> usize {
        self.append(Instruction::Condj {
            page,
            lhs,
            op: op.into(),
            rhs,
            target: target.into(),
        })
    }

    pub fn seti(&mut self, ch: u8, page: u8, reg: u8, t: i64) -> usize {
        self.append(Instruction::Seti { ch, page, reg, t })
    }

    pub fn synci(&mut self, t: i64) -> usize {
        self.append(Instruction::Synci { t })
    }

    pub fn waiti(&mut self, ch: u8, t: i64) -> usize {
        self.append(Instruction::Waiti { ch, t })
    }

    pub fn end(&mut self) -> usize {
        self.append(Instruction::End)
    }
}

fn render_template(template: &str, operands: &[Operand]) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '{' {
            out.push(c);
            continue;
        }
        let index: String = chars.by_ref().take_while(|&c| c != '}').collect();
        match index.parse::<usize>().ok().and_then(|i| operands.get(i)) {
            Some(operand) => out.push_str(&operand.to_string()),
            None => out.push('?'),
        }
    }
    out
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let indent = self.labels.keys().map(|l| l.len() + 2).max().unwrap_or(0);
        let mut labels_at: IndexMap<usize, Vec<&str>> = IndexMap::new();
        for (name, &pc) in &self.labels {
            labels_at.entry(pc).or_default().push(name);
        }

        writeln!(f, "// Program")?;
        for (pc, stmt) in self.statements.iter().enumerate() {
            for label in labels_at.get(&pc).into_iter().flatten() {
                writeln!(f, "{label}:")?;
            }
            let mnemonic = stmt.instruction.mnemonic();
            let operands = render_template(mnemonic.def().template, &stmt.instruction.operands());
            let line = if operands.is_empty() {
                format!("{mnemonic};")
            } else {
                format!("{mnemonic} {operands};")
            };
            write!(f, "{:indent$}{line}", "")?;
            if let Some(comment) = &stmt.comment {
                write!(f, "  // {comment}")?;
            }
            writeln!(f)?;
        }
        for label in labels_at.get(&self.statements.len()).into_iter().flatten() {
            writeln!(f, "{label}:")?;
        }
        Ok(())
    }
}
