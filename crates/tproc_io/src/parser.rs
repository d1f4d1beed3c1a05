//! Parser for tProc assembly listings.
//!
//! The grammar is the one [`Program`]'s listing renders:
//!
//! ```text
//! <line>     ::= [<label> ':'] [<mnemonic> <operands> ';'] ['//' <comment>]
//! <operands> ::= <operand> ((',' | ' ') <operand>)*
//! <operand>  ::= '$' <digits> | '@' <ident> | <int> | <operator>
//! <int>      ::= ['-'] (<digits> | '0x' <hexdigits>)
//! ```
//!
//! Whitespace around tokens is free. A label may share its line with an
//! instruction or stand alone; either way it binds to the next instruction.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, hex_digit1, space0, space1},
    combinator::{all_consuming, map, map_res, not, opt, recognize, rest},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
};
use tproc_core::AssemblyError;
use tproc_core::program::{Instruction, OpRef, Operand, Program};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: cannot parse {text:?}")]
    Syntax { line: usize, text: String },

    #[error("line {line}: {source}")]
    Assembly {
        line: usize,
        #[source]
        source: AssemblyError,
    },
}

/// One source line split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line<'a> {
    pub label: Option<&'a str>,
    pub instruction: Option<(&'a str, Vec<Operand>)>,
    pub comment: Option<&'a str>,
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(is_ident),
    ))(input)
}

fn integer(input: &str) -> IResult<&str, i64> {
    let hex = map_res(preceded(tag_no_case("0x"), hex_digit1), |digits| {
        i64::from_str_radix(digits, 16)
    });
    let dec = map_res(digit1, str::parse::<i64>);
    map(
        pair(opt(char('-')), alt((hex, dec))),
        |(sign, value)| if sign.is_some() { -value } else { value },
    )(input)
}

fn register(input: &str) -> IResult<&str, u8> {
    preceded(char('$'), map_res(digit1, str::parse::<u8>))(input)
}

fn operator(input: &str) -> IResult<&str, &str> {
    alt((
        tag(">="),
        tag("<="),
        tag("=="),
        tag("!="),
        tag("<<"),
        tag(">>"),
        tag(">"),
        tag("<"),
        tag("+"),
        tag("-"),
        tag("*"),
        tag("&"),
        tag("|"),
        tag("^"),
        tag("~"),
        terminated(alt((tag("upper"), tag("lower"))), not(take_while1(is_ident))),
    ))(input)
}

fn operand(input: &str) -> IResult<&str, Operand> {
    alt((
        map(register, Operand::Reg),
        map(preceded(char('@'), ident), |name| {
            Operand::Label(name.to_string())
        }),
        map(integer, Operand::Int),
        map(operator, |sym| Operand::Op(OpRef::from(sym))),
    ))(input)
}

fn separator(input: &str) -> IResult<&str, ()> {
    map(alt((delimited(space0, tag(","), space0), space1)), |_| ())(input)
}

fn operands(input: &str) -> IResult<&str, Vec<Operand>> {
    map(
        opt(pair(operand, many0(preceded(separator, operand)))),
        |parsed| match parsed {
            Some((first, others)) => std::iter::once(first).chain(others).collect(),
            None => Vec::new(),
        },
    )(input)
}

fn instruction(input: &str) -> IResult<&str, (&str, Vec<Operand>)> {
    terminated(
        pair(terminated(ident, space0), operands),
        preceded(space0, char(';')),
    )(input)
}

fn comment(input: &str) -> IResult<&str, &str> {
    map(preceded(tag("//"), rest), str::trim)(input)
}

/// Splits one line (without its line ending) into label, instruction and
/// comment.
pub fn line(input: &str) -> IResult<&str, Line<'_>> {
    map(
        all_consuming(tuple((
            space0,
            opt(terminated(ident, preceded(space0, char(':')))),
            space0,
            opt(instruction),
            space0,
            opt(comment),
        ))),
        |(_, label, _, instruction, _, comment)| Line {
            label,
            instruction,
            comment,
        },
    )(input)
}

/// Assembles a listing into a [`Program`].
///
/// Errors carry the 1-based line number. Operand values are not range
/// checked here; encode the program to validate them.
pub fn parse_program(text: &str) -> Result<Program, ParseError> {
    let mut program = Program::new();
    for (index, raw) in text.lines().enumerate() {
        let number = index + 1;
        let (_, parsed) = line(raw.trim_end()).map_err(|_| ParseError::Syntax {
            line: number,
            text: raw.to_string(),
        })?;

        let assembly = |source| ParseError::Assembly {
            line: number,
            source,
        };
        if let Some(label) = parsed.label {
            program.define_label(label).map_err(assembly)?;
        }
        if let Some((name, operands)) = parsed.instruction {
            let instruction = Instruction::parse_parts(name, operands).map_err(assembly)?;
            match parsed.comment {
                Some(text) if !text.is_empty() => program.append_with_comment(instruction, text),
                _ => program.append(instruction),
            };
        }
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tproc_common::isa::{Mnemonic, Operator};

    #[test]
    fn splits_label_instruction_and_comment() {
        let (_, parsed) = line("LOOP:  mathi 0, $14, $14 - 1;  // count down").unwrap();
        assert_eq!(parsed.label, Some("LOOP"));
        assert_eq!(parsed.comment, Some("count down"));
        let (name, ops) = parsed.instruction.unwrap();
        assert_eq!(name, "mathi");
        assert_eq!(
            ops,
            vec![
                Operand::Int(0),
                Operand::Reg(14),
                Operand::Reg(14),
                Operand::Op(OpRef::from("-")),
                Operand::Int(1),
            ]
        );
    }

    #[test]
    fn negative_and_hex_immediates() {
        let (_, parsed) = line("mathi 1, $2, $3 + -5;").unwrap();
        assert_eq!(parsed.instruction.unwrap().1[4], Operand::Int(-5));
        let (_, parsed) = line("regwi 0, $1, 0x7FFF;").unwrap();
        assert_eq!(parsed.instruction.unwrap().1[2], Operand::Int(0x7FFF));
    }

    #[test]
    fn blank_and_comment_lines_are_empty() {
        for text in ["", "   ", "// Program"] {
            let (_, parsed) = line(text).unwrap();
            assert_eq!(parsed.label, None);
            assert_eq!(parsed.instruction, None);
        }
    }

    #[test]
    fn word_operators_need_a_boundary() {
        let (_, parsed) = line("read 0, 0, upper $5;").unwrap();
        assert_eq!(
            parsed.instruction.unwrap().1[2],
            Operand::Op(OpRef::from("upper"))
        );
        assert!(line("read 0, 0, uppercase $5;").is_err());
    }

    #[test]
    fn missing_semicolon_is_a_syntax_error() {
        let err = parse_program("regwi 0, $1, 5;\nregwi 0, $2, 6\n").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { line: 2, .. }));
    }

    #[test]
    fn semantic_errors_carry_the_line() {
        let err = parse_program("end;\nfoo 1, 2;").unwrap_err();
        assert!(matches!(
            err,
            ParseError::Assembly { line: 2, source: AssemblyError::UnknownMnemonic(ref m) } if m == "foo"
        ));
        let err = parse_program("A:\nend;\nA: end;").unwrap_err();
        assert!(matches!(
            err,
            ParseError::Assembly { line: 3, source: AssemblyError::DuplicateLabel(_) }
        ));
    }

    #[test]
    fn builds_typed_instructions() {
        let prog = parse_program(
            "regwi 0, $14, 3;\nL:\n  condj 0, $14, >=, $0, @L;\n  loopnz 0, $14, @L;\nend;",
        )
        .unwrap();
        assert_eq!(prog.len(), 4);
        assert_eq!(prog.label_pc("L"), Some(1));
        assert_eq!(
            prog.statements()[1].instruction,
            Instruction::Condj {
                page: 0,
                lhs: 14,
                op: OpRef::from(">="),
                rhs: 0,
                target: "L".into(),
            }
        );
        assert_eq!(prog.statements()[2].instruction.mnemonic(), Mnemonic::Loopnz);
        assert_eq!(OpRef::from(">=").resolve(), Ok(Operator::Ge));
    }
}
