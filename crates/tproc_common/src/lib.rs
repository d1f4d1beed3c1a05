//! Common definitions shared across the timed processor (tProc) toolchain.
//!
//! This crate provides the instruction set tables of the tProc v1 (64-bit
//! instruction words, 32-bit registers, 8 register pages), the operator codes
//! embedded in arithmetic and branch instructions, and the data memory layout
//! the host uses to observe a running program. It carries no dependencies so
//! it can be shared by the assembler, the emulator and hardware backends alike.

#![no_std]

// Data memory layout of the tProc.
//
// The data memory is a bank of 32-bit words reachable both from the program
// (`memwi`/`memri`) and from the host through single AXI reads and writes.
// The lower section of the AXI window is reserved for control registers, so
// host-side word addresses must be translated with `DMEM_OFFSET`.
pub mod dmem {
    /// Data memory word where averaging programs publish their shot counter.
    ///
    /// The acquisition streamer polls this address to learn how many samples
    /// the hardware has accumulated so far.
    pub const COUNTER_ADDR: u32 = 1;

    /// Byte offset of data memory inside the processor's AXI register window.
    pub const DMEM_OFFSET: usize = 256;

    /// Number of 32-bit words in data memory (2^10).
    pub const DMEM_DEPTH: usize = 1 << 10;

    /// Number of 64-bit words in program memory (2^16).
    ///
    /// Jump targets are program counters, so their field is as wide as the
    /// program memory address bus.
    pub const PMEM_DEPTH: usize = 1 << 16;

    /// Translates a data memory word address to its AXI byte offset.
    pub const fn axi_offset(addr: u32) -> usize {
        4 * addr as usize + DMEM_OFFSET
    }
}

/// Instruction set definitions for the tProc v1.
///
/// Every instruction is a single 64-bit word: the opcode occupies bits 56..63
/// and the operands are packed into fixed bit fields below it. The tables in
/// this module are the single source of truth for those layouts; both the
/// assembler and the decoder are driven by them.
pub mod isa {
    use core::fmt;
    use core::str::FromStr;

    /// Bit position of the 8-bit opcode field.
    pub const OPCODE_SHIFT: u32 = 56;

    /// Tag OR'd into every `loopnz` word.
    ///
    /// `loopnz` shares the jump opcode class with `end` and `condj`; the
    /// constant pattern in the operator field marks it as a decrement-and-branch.
    pub const LOOPNZ_MARKER: u64 = 0b1000 << 46;

    /// Upper bound on the operand count of any mnemonic (`set` has eight).
    pub const MAX_OPERANDS: usize = 8;

    /// Lookup of a mnemonic or operator symbol failed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnknownSymbol;

    /// Instruction class, as used by the processor's decode stage.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum InstrType {
        /// Register/immediate instructions (`regwi`, `mathi`, `synci`, ...).
        Immediate,
        /// Single-register jumps (`loopnz`, `end`).
        Jump1,
        /// Conditional jumps comparing two registers (`condj`).
        Jump2,
        /// Register-only instructions (`math`, `set`, `memw`, ...).
        Register,
    }

    /// What an operand field holds. The kind fixes the field width.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum FieldKind {
        /// Register page number.
        Page,
        /// Output channel number.
        Channel,
        /// Register number within a page.
        Register,
        /// Operator code (see [`Operator`]).
        Operator,
        /// 31-bit two's complement immediate.
        Immediate,
        /// Program counter of a jump target.
        Target,
    }

    impl FieldKind {
        /// Field width in bits.
        pub const fn width(self) -> u32 {
            match self {
                FieldKind::Page | FieldKind::Channel => 3,
                FieldKind::Register => 5,
                FieldKind::Operator => 4,
                FieldKind::Immediate => 31,
                FieldKind::Target => 16,
            }
        }
    }

    /// Placement of one operand inside the instruction word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Field {
        /// Index of the operand in the instruction's operand list.
        pub operand: usize,
        /// Position of the field's least significant bit.
        pub offset: u32,
        pub kind: FieldKind,
    }

    impl Field {
        const fn new(operand: usize, offset: u32, kind: FieldKind) -> Self {
            Self {
                operand,
                offset,
                kind,
            }
        }

        pub const fn width(&self) -> u32 {
            self.kind.width()
        }

        /// Mask covering the field's bits in place.
        pub const fn mask(&self) -> u64 {
            ((1u64 << self.width()) - 1) << self.offset
        }

        /// Extracts this field's raw value from an encoded word.
        pub const fn extract(&self, word: u64) -> u64 {
            (word & self.mask()) >> self.offset
        }
    }

    /// Static description of one mnemonic.
    #[derive(Debug)]
    pub struct MnemonicDef {
        pub name: &'static str,
        pub kind: InstrType,
        pub opcode: u8,
        /// Operand fields. An operand may be written to more than one field.
        pub fields: &'static [Field],
        /// Constant bits OR'd into every encoded word.
        pub marker: u64,
        /// Listing template; `{n}` is replaced by operand `n`.
        pub template: &'static str,
    }

    impl MnemonicDef {
        /// Number of operands the mnemonic takes.
        pub fn arity(&self) -> usize {
            self.fields
                .iter()
                .map(|f| f.operand + 1)
                .max()
                .unwrap_or(0)
        }

        /// Kind of operand `index`, taken from the first field it lands in.
        pub fn operand_kind(&self, index: usize) -> Option<FieldKind> {
            self.fields
                .iter()
                .find(|f| f.operand == index)
                .map(|f| f.kind)
        }
    }

    use FieldKind::{Channel as C, Immediate as I, Operator as O, Page as P, Register as R, Target as T};

    macro_rules! mnemonics {
        ($($variant:ident = $name:literal, $kind:ident, $opcode:literal, [$(($op:literal, $off:literal, $fk:ident)),*], $marker:expr, $template:literal;)*) => {
            /// tProc v1 mnemonics. The discriminant is the binary opcode.
            #[repr(u8)]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum Mnemonic {
                $($variant = $opcode,)*
            }

            impl Mnemonic {
                /// Every mnemonic of the instruction set, in opcode order.
                pub const ALL: &'static [Mnemonic] = &[$(Mnemonic::$variant,)*];

                /// Returns the static definition of this mnemonic.
                pub fn def(self) -> &'static MnemonicDef {
                    match self {
                        $(Mnemonic::$variant => {
                            static DEF: MnemonicDef = MnemonicDef {
                                name: $name,
                                kind: InstrType::$kind,
                                opcode: $opcode,
                                fields: &[$(Field::new($op, $off, $fk)),*],
                                marker: $marker,
                                template: $template,
                            };
                            &DEF
                        })*
                    }
                }

                /// Looks up the mnemonic owning a binary opcode.
                pub fn from_opcode(opcode: u8) -> Option<Mnemonic> {
                    match opcode {
                        $($opcode => Some(Mnemonic::$variant),)*
                        _ => None,
                    }
                }
            }

            impl FromStr for Mnemonic {
                type Err = UnknownSymbol;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    match s {
                        $($name => Ok(Mnemonic::$variant),)*
                        _ => Err(UnknownSymbol),
                    }
                }
            }
        };
    }

    mnemonics! {
        Pushi = "pushi", Immediate, 0b0001_0000, [(0, 53, P), (1, 41, R), (2, 36, R), (3, 0, I)], 0, "{0}, ${1}, ${2}, {3}";
        Popi = "popi", Immediate, 0b0001_0001, [(0, 53, P), (1, 41, R)], 0, "{0}, ${1}";
        Mathi = "mathi", Immediate, 0b0001_0010, [(0, 53, P), (1, 41, R), (2, 36, R), (3, 46, O), (4, 0, I)], 0, "{0}, ${1}, ${2} {3} {4}";
        Seti = "seti", Immediate, 0b0001_0011, [(1, 53, P), (0, 50, C), (2, 36, R), (3, 0, I)], 0, "{0}, {1}, ${2}, {3}";
        Synci = "synci", Immediate, 0b0001_0100, [(0, 0, I)], 0, "{0}";
        Waiti = "waiti", Immediate, 0b0001_0101, [(0, 50, C), (1, 0, I)], 0, "{0}, {1}";
        Bitwi = "bitwi", Immediate, 0b0001_0110, [(0, 53, P), (3, 46, O), (1, 41, R), (2, 36, R), (4, 0, I)], 0, "{0}, ${1}, ${2} {3} {4}";
        Memri = "memri", Immediate, 0b0001_0111, [(0, 53, P), (1, 41, R), (2, 0, I)], 0, "{0}, ${1}, {2}";
        Memwi = "memwi", Immediate, 0b0001_1000, [(0, 53, P), (1, 31, R), (2, 0, I)], 0, "{0}, ${1}, {2}";
        Regwi = "regwi", Immediate, 0b0001_1001, [(0, 53, P), (1, 41, R), (2, 0, I)], 0, "{0}, ${1}, {2}";
        Setbi = "setbi", Immediate, 0b0001_1010, [(0, 53, P), (1, 41, R), (2, 0, I)], 0, "{0}, ${1}, {2}";
        Loopnz = "loopnz", Jump1, 0b0011_0000, [(0, 53, P), (1, 41, R), (1, 36, R), (2, 0, T)], LOOPNZ_MARKER, "{0}, ${1}, @{2}";
        Condj = "condj", Jump2, 0b0011_0001, [(0, 53, P), (2, 46, O), (1, 36, R), (3, 31, R), (4, 0, T)], 0, "{0}, ${1}, {2}, ${3}, @{4}";
        End = "end", Jump1, 0b0011_1111, [], 0, "";
        Math = "math", Register, 0b0101_0000, [(0, 53, P), (3, 46, O), (1, 41, R), (2, 36, R), (4, 31, R)], 0, "{0}, ${1}, ${2} {3} ${4}";
        Set = "set", Register, 0b0101_0001, [(1, 53, P), (0, 50, C), (2, 36, R), (7, 31, R), (3, 26, R), (4, 21, R), (5, 16, R), (6, 11, R)], 0, "{0}, {1}, ${2}, ${3}, ${4}, ${5}, ${6}, ${7}";
        Sync = "sync", Register, 0b0101_0010, [(0, 53, P), (1, 31, R)], 0, "{0}, ${1}";
        Read = "read", Register, 0b0101_0011, [(1, 53, P), (0, 50, C), (2, 46, O), (3, 41, R)], 0, "{0}, {1}, {2} ${3}";
        Wait = "wait", Register, 0b0101_0100, [(1, 53, P), (0, 50, C), (2, 31, R)], 0, "{0}, {1}, ${2}";
        Bitw = "bitw", Register, 0b0101_0101, [(0, 53, P), (1, 41, R), (2, 36, R), (3, 46, O), (4, 31, R)], 0, "{0}, ${1}, ${2} {3} ${4}";
        Memr = "memr", Register, 0b0101_0110, [(0, 53, P), (1, 41, R), (2, 36, R)], 0, "{0}, ${1}, ${2}";
        Memw = "memw", Register, 0b0101_0111, [(0, 53, P), (2, 36, R), (1, 31, R)], 0, "{0}, ${1}, ${2}";
        Setb = "setb", Register, 0b0101_1000, [(0, 53, P), (2, 36, R), (1, 31, R)], 0, "{0}, ${1}, ${2}";
    }

    impl Mnemonic {
        pub fn name(self) -> &'static str {
            self.def().name
        }

        pub fn opcode(self) -> u8 {
            self as u8
        }
    }

    impl fmt::Display for Mnemonic {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name())
        }
    }

    /// Operators embedded in `math`, `mathi`, `bitw`, `bitwi`, `condj` and `read`.
    ///
    /// Comparison, arithmetic and bitwise operators live in separate code
    /// spaces, so several symbols share the same binary code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Operator {
        Gt,
        Ge,
        Lt,
        Le,
        Eq,
        Ne,
        Add,
        Sub,
        Mul,
        And,
        Or,
        Xor,
        Not,
        Shl,
        Shr,
        Upper,
        Lower,
    }

    impl Operator {
        pub const ALL: &'static [Operator] = &[
            Operator::Gt,
            Operator::Ge,
            Operator::Lt,
            Operator::Le,
            Operator::Eq,
            Operator::Ne,
            Operator::Add,
            Operator::Sub,
            Operator::Mul,
            Operator::And,
            Operator::Or,
            Operator::Xor,
            Operator::Not,
            Operator::Shl,
            Operator::Shr,
            Operator::Upper,
            Operator::Lower,
        ];

        /// Binary code placed in the 4-bit operator field.
        pub const fn code(self) -> u8 {
            match self {
                Operator::Gt => 0b0000,
                Operator::Ge => 0b0001,
                Operator::Lt => 0b0010,
                Operator::Le => 0b0011,
                Operator::Eq => 0b0100,
                Operator::Ne => 0b0101,
                Operator::Add => 0b1000,
                Operator::Sub => 0b1001,
                Operator::Mul => 0b1010,
                Operator::And => 0b0000,
                Operator::Or => 0b0001,
                Operator::Xor => 0b0010,
                Operator::Not => 0b0011,
                Operator::Shl => 0b0100,
                Operator::Shr => 0b0101,
                Operator::Upper => 0b1010,
                Operator::Lower => 0b0101,
            }
        }

        pub const fn symbol(self) -> &'static str {
            match self {
                Operator::Gt => ">",
                Operator::Ge => ">=",
                Operator::Lt => "<",
                Operator::Le => "<=",
                Operator::Eq => "==",
                Operator::Ne => "!=",
                Operator::Add => "+",
                Operator::Sub => "-",
                Operator::Mul => "*",
                Operator::And => "&",
                Operator::Or => "|",
                Operator::Xor => "^",
                Operator::Not => "~",
                Operator::Shl => "<<",
                Operator::Shr => ">>",
                Operator::Upper => "upper",
                Operator::Lower => "lower",
            }
        }
    }

    impl FromStr for Operator {
        type Err = UnknownSymbol;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Operator::ALL
                .iter()
                .copied()
                .find(|op| op.symbol() == s)
                .ok_or(UnknownSymbol)
        }
    }

    impl fmt::Display for Operator {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.symbol())
        }
    }

    /// Raw operand values recovered from an instruction word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Decoded {
        pub mnemonic: Mnemonic,
        /// Operand values indexed like the mnemonic's operand list. Only the
        /// first [`MnemonicDef::arity`] entries are meaningful.
        pub operands: [u64; MAX_OPERANDS],
    }

    impl Decoded {
        pub fn operands(&self) -> &[u64] {
            &self.operands[..self.mnemonic.def().arity()]
        }
    }

    /// Splits a word back into its mnemonic and raw operand fields.
    ///
    /// Returns `None` when the opcode is not part of the instruction set.
    /// Immediates are returned as raw 31-bit patterns; use
    /// [`immediate_value`] to recover their signed value.
    pub fn decode(word: u64) -> Option<Decoded> {
        let mnemonic = Mnemonic::from_opcode((word >> OPCODE_SHIFT) as u8)?;
        let mut operands = [0u64; MAX_OPERANDS];
        for field in mnemonic.def().fields {
            operands[field.operand] = field.extract(word);
        }
        Some(Decoded { mnemonic, operands })
    }

    /// Sign-extends a raw 31-bit immediate field.
    pub const fn immediate_value(raw: u64) -> i64 {
        let width = FieldKind::Immediate.width();
        let sign = 1u64 << (width - 1);
        if raw & sign != 0 {
            raw as i64 - (1i64 << width)
        } else {
            raw as i64
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn fields_fit_and_never_overlap() {
            for &m in Mnemonic::ALL {
                let def = m.def();
                let mut used = 0xFFu64 << OPCODE_SHIFT;
                used |= def.marker;
                for (i, field) in def.fields.iter().enumerate() {
                    assert!(field.offset + field.width() <= OPCODE_SHIFT, "{m} field {i}");
                    assert_eq!(used & field.mask(), 0, "{m} field {i} overlaps");
                    used |= field.mask();
                }
                assert_eq!(def.opcode, m.opcode());
            }
        }

        #[test]
        fn opcode_and_name_lookups_agree() {
            for &m in Mnemonic::ALL {
                assert_eq!(Mnemonic::from_opcode(m.opcode()), Some(m));
                assert_eq!(m.name().parse::<Mnemonic>(), Ok(m));
            }
            assert_eq!("jmp".parse::<Mnemonic>(), Err(UnknownSymbol));
            assert_eq!(Mnemonic::from_opcode(0), None);
        }

        #[test]
        fn operator_codes_match_hardware_table() {
            assert_eq!("+".parse::<Operator>().map(Operator::code), Ok(0b1000));
            assert_eq!("-".parse::<Operator>().map(Operator::code), Ok(0b1001));
            assert_eq!("<<".parse::<Operator>().map(Operator::code), Ok(0b0100));
            assert_eq!("upper".parse::<Operator>().map(Operator::code), Ok(0b1010));
            assert_eq!("%".parse::<Operator>(), Err(UnknownSymbol));
        }

        #[test]
        fn loopnz_repeats_its_register_operand() {
            let def = Mnemonic::Loopnz.def();
            assert_eq!(def.arity(), 3);
            let word = (u64::from(Mnemonic::Loopnz.opcode()) << OPCODE_SHIFT)
                | LOOPNZ_MARKER
                | (14 << 41)
                | (14 << 36)
                | 7;
            let decoded = decode(word).unwrap();
            assert_eq!(decoded.mnemonic, Mnemonic::Loopnz);
            assert_eq!(decoded.operands(), &[0, 14, 7]);
        }

        #[test]
        fn immediates_sign_extend_from_bit_30() {
            assert_eq!(immediate_value(5), 5);
            assert_eq!(immediate_value((1 << 31) - 1), -1);
            assert_eq!(immediate_value(1 << 30), -(1 << 30));
        }
    }
}
