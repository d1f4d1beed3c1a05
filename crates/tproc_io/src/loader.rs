use anyhow::{Context, Result, bail};
use bitvec::prelude::*;
use std::fs;
use std::path::Path;

/// Text encoding of a word listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// `0x` followed by 16 hex digits per line.
    Hex,
    /// `0b` followed by 64 binary digits per line.
    Bin,
}

impl Format {
    /// Picks the format from a file extension, defaulting to hex.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("bin") => Format::Bin,
            _ => Format::Hex,
        }
    }
}

/// Renders one word per line.
pub fn format_words(words: &[u64], format: Format) -> String {
    words
        .iter()
        .map(|w| match format {
            Format::Hex => format!("{w:#018x}\n"),
            Format::Bin => format!("{w:#066b}\n"),
        })
        .collect()
}

/// Parses a word listing. Both prefixes may be mixed; blank lines and
/// `//` comments are skipped.
pub fn parse_words(text: &str) -> Result<Vec<u64>> {
    let mut words = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let parsed = if let Some(hex) = line.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)
        } else if let Some(bin) = line.strip_prefix("0b") {
            u64::from_str_radix(bin, 2)
        } else {
            bail!("line {}: expected 0x or 0b word, found {line:?}", index + 1);
        };
        words.push(parsed.with_context(|| format!("line {}: invalid word {line:?}", index + 1))?);
    }
    Ok(words)
}

/// Loads a `.hex` or `.bin` word listing.
pub fn load_words<P: AsRef<Path>>(path: P) -> Result<Vec<u64>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read listing {}", path.display()))?;
    parse_words(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Writes a word listing in the format implied by the extension.
pub fn save_words<P: AsRef<Path>>(path: P, words: &[u64]) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, format_words(words, Format::from_path(path)))
        .with_context(|| format!("Failed to write listing {}", path.display()))
}

/// A word that differs between two programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordDiff {
    pub index: usize,
    /// `None` when the program is shorter than `index`.
    pub left: Option<u64>,
    pub right: Option<u64>,
    /// Differing bit positions, LSB first. Empty when a side is missing.
    pub bits: Vec<usize>,
}

/// Lists every word position at which `left` and `right` differ.
pub fn compare_programs(left: &[u64], right: &[u64]) -> Vec<WordDiff> {
    (0..left.len().max(right.len()))
        .filter_map(|index| {
            let (l, r) = (left.get(index).copied(), right.get(index).copied());
            if l == r {
                return None;
            }
            let bits = match (l, r) {
                (Some(a), Some(b)) => (a ^ b).view_bits::<Lsb0>().iter_ones().collect(),
                _ => Vec::new(),
            };
            Some(WordDiff {
                index,
                left: l,
                right: r,
                bits,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_formats_parse_back() {
        let words = [0x1900_0000_0000_0005, u64::MAX, 0];
        for format in [Format::Hex, Format::Bin] {
            let text = format_words(&words, format);
            assert_eq!(text.lines().count(), 3);
            assert_eq!(parse_words(&text).unwrap(), words);
        }
        assert!(format_words(&[1], Format::Hex).starts_with("0x0000000000000001"));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let words = parse_words("// header\n\n0x10  // first\n0b11\n").unwrap();
        assert_eq!(words, vec![0x10, 0b11]);
    }

    #[test]
    fn bad_lines_are_rejected() {
        assert!(parse_words("0x10\n42\n").is_err());
        assert!(parse_words("0xZZ\n").is_err());
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(Format::from_path("prog.bin"), Format::Bin);
        assert_eq!(Format::from_path("prog.hex"), Format::Hex);
        assert_eq!(Format::from_path("prog"), Format::Hex);
    }

    #[test]
    fn diff_reports_bit_positions_and_missing_words() {
        let left = [0b1010, 7, 1 << 63];
        let right = [0b0011, 7];
        let diff = compare_programs(&left, &right);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[0].index, 0);
        assert_eq!(diff[0].bits, vec![0, 3]);
        assert_eq!(diff[1].index, 2);
        assert_eq!(diff[1].right, None);
        assert!(diff[1].bits.is_empty());
        assert!(compare_programs(&left, &left).is_empty());
    }

    #[test]
    fn files_round_trip() {
        let dir = std::env::temp_dir().join(format!("tproc_io_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let words = vec![0x5100_0000_0000_0000, 42];
        for name in ["prog.hex", "prog.bin"] {
            let path = dir.join(name);
            save_words(&path, &words).unwrap();
            assert_eq!(load_words(&path).unwrap(), words);
        }
        fs::remove_dir_all(&dir).unwrap();
    }
}
