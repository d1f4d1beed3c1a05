use tproc_common::isa::{Field, FieldKind};

pub struct FieldPack;

impl FieldPack {
    /// Converts an operand value into the raw bit pattern of a field.
    ///
    /// Immediates are 31-bit two's complement: negative values down to
    /// `-2^30` are stored as `2^31 + value`. Every other field is unsigned.
    /// Returns `None` when the value does not fit.
    #[inline]
    pub fn fit(value: i64, kind: FieldKind) -> Option<u64> {
        let width = kind.width();
        let span = 1i64 << width;
        match kind {
            FieldKind::Immediate => {
                if value < -(span >> 1) || value >= span {
                    None
                } else if value < 0 {
                    Some((span + value) as u64)
                } else {
                    Some(value as u64)
                }
            }
            _ => (0..span).contains(&value).then_some(value as u64),
        }
    }

    /// Places an already fitted raw value at its field position.
    #[inline(always)]
    pub fn place(raw: u64, field: &Field) -> u64 {
        debug_assert_eq!(raw >> field.width(), 0);
        (raw << field.offset) & field.mask()
    }

    /// Reduces a value modulo `2^width`, as a register of that width holds it.
    #[inline(always)]
    pub fn wrap(value: i64, width: u32) -> u64 {
        if width >= 64 {
            value as u64
        } else {
            (value as u64) & ((1u64 << width) - 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediates_accept_negative_values() {
        assert_eq!(FieldPack::fit(-1, FieldKind::Immediate), Some((1 << 31) - 1));
        assert_eq!(FieldPack::fit(-(1 << 30), FieldKind::Immediate), Some(1 << 30));
        assert_eq!(FieldPack::fit(-(1 << 30) - 1, FieldKind::Immediate), None);
        assert_eq!(FieldPack::fit(1 << 31, FieldKind::Immediate), None);
    }

    #[test]
    fn unsigned_fields_reject_out_of_range() {
        assert_eq!(FieldPack::fit(31, FieldKind::Register), Some(31));
        assert_eq!(FieldPack::fit(32, FieldKind::Register), None);
        assert_eq!(FieldPack::fit(-1, FieldKind::Page), None);
        assert_eq!(FieldPack::fit(7, FieldKind::Page), Some(7));
    }

    #[test]
    fn wrap_matches_register_width() {
        assert_eq!(FieldPack::wrap(-1, 16), 0xFFFF);
        assert_eq!(FieldPack::wrap(0x1_0000_0005, 32), 5);
    }
}
