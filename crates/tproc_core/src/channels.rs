//! Register/channel model.
//!
//! The tProc has eight independent register pages of 32 registers each.
//! Register 0 of every page is hard-wired to zero. Each output channel owns a
//! fixed set of special registers (frequency, phase, envelope address, gain,
//! mode, start time) inside one page; even/odd channel pairs share a page.
//!
//! The mapping differs between firmware builds, so it is never derived here:
//! it comes in as a [`RegisterMapConfig`], either from the built-in
//! [`RegisterMapConfig::qsystem2`] preset or from JSON written by the board
//! layer.

use crate::{AssemblyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tproc_common::isa::FieldKind;

/// Width of a tProc register in bits.
pub const REGISTER_WIDTH: u32 = 32;

/// Number of register pages addressable by the 3-bit page field.
pub const NUM_PAGES: u8 = 1 << FieldKind::Page.width();

/// Number of registers per page addressable by the 5-bit register field.
pub const REGS_PER_PAGE: u8 = 1 << FieldKind::Register.width();

/// Pulse parameter held by a channel's special register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialRegister {
    Freq,
    Phase,
    Addr,
    Gain,
    Mode,
    #[serde(rename = "t")]
    Time,
    AdcFreq,
}

impl SpecialRegister {
    pub const ALL: [SpecialRegister; 7] = [
        SpecialRegister::Freq,
        SpecialRegister::Phase,
        SpecialRegister::Addr,
        SpecialRegister::Gain,
        SpecialRegister::Mode,
        SpecialRegister::Time,
        SpecialRegister::AdcFreq,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SpecialRegister::Freq => "freq",
            SpecialRegister::Phase => "phase",
            SpecialRegister::Addr => "addr",
            SpecialRegister::Gain => "gain",
            SpecialRegister::Mode => "mode",
            SpecialRegister::Time => "t",
            SpecialRegister::AdcFreq => "adc_freq",
        }
    }
}

impl fmt::Display for SpecialRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A register identified by page and number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterAddr {
    pub page: u8,
    pub reg: u8,
}

impl RegisterAddr {
    pub const fn new(page: u8, reg: u8) -> Self {
        Self { page, reg }
    }
}

impl fmt::Display for RegisterAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:${}", self.page, self.reg)
    }
}

/// One channel's row of the register map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub channel: u8,
    pub page: u8,
    pub registers: BTreeMap<SpecialRegister, u8>,
}

/// Register map as supplied by the board/firmware layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMapConfig {
    pub channels: Vec<ChannelEntry>,

    /// Effective bit width of each special register's value. Registers not
    /// listed use the full [`REGISTER_WIDTH`].
    #[serde(default)]
    pub widths: BTreeMap<SpecialRegister, u32>,
}

impl RegisterMapConfig {
    /// The seven-channel map of the first tProc firmware.
    ///
    /// Channel `ch` (1-based) lives on page `(ch - 1) / 2`. Odd channels use
    /// registers 16..=22 and even channels 23..=29 of their page.
    pub fn qsystem2() -> Self {
        let channels = (1..=7u8)
            .map(|channel| {
                let base = if channel % 2 == 1 { 16 } else { 23 };
                let registers = SpecialRegister::ALL
                    .iter()
                    .enumerate()
                    .map(|(i, &name)| (name, base + i as u8))
                    .collect();
                ChannelEntry {
                    channel,
                    page: (channel - 1) / 2,
                    registers,
                }
            })
            .collect();

        let widths = [
            (SpecialRegister::Freq, 32),
            (SpecialRegister::Phase, 16),
            (SpecialRegister::Gain, 16),
            (SpecialRegister::AdcFreq, 16),
        ]
        .into_iter()
        .collect();

        Self { channels, widths }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| AssemblyError::InvalidRegisterMap(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AssemblyError::InvalidRegisterMap(e.to_string()))
    }
}

/// Validated, read-only view of a register map.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    channels: BTreeMap<u8, ChannelEntry>,
    widths: BTreeMap<SpecialRegister, u32>,
}

impl ChannelMap {
    /// Validates a register map and builds the lookup tables.
    ///
    /// Rejects duplicate channels, pages or registers outside the addressable
    /// range, register 0 (hard-wired to zero) used as a special register, two
    /// special registers aliasing on one page, and widths outside `1..=32`.
    pub fn new(config: RegisterMapConfig) -> Result<Self> {
        let invalid = |msg: String| Err(AssemblyError::InvalidRegisterMap(msg));

        let mut channels = BTreeMap::new();
        let mut owners: BTreeMap<RegisterAddr, (u8, SpecialRegister)> = BTreeMap::new();

        for entry in config.channels {
            if entry.page >= NUM_PAGES {
                return invalid(format!("channel {} uses page {}", entry.channel, entry.page));
            }
            for (&name, &reg) in &entry.registers {
                if reg == 0 || reg >= REGS_PER_PAGE {
                    return invalid(format!(
                        "channel {} `{name}` uses register {reg}",
                        entry.channel
                    ));
                }
                let addr = RegisterAddr::new(entry.page, reg);
                if let Some((other, other_name)) = owners.insert(addr, (entry.channel, name)) {
                    return invalid(format!(
                        "register {addr} shared by channel {other} `{other_name}` and channel {} `{name}`",
                        entry.channel
                    ));
                }
            }
            let channel = entry.channel;
            if channels.insert(channel, entry).is_some() {
                return invalid(format!("channel {channel} listed twice"));
            }
        }

        for (&name, &width) in &config.widths {
            if width == 0 || width > REGISTER_WIDTH {
                return invalid(format!("`{name}` width {width}"));
            }
        }

        Ok(Self {
            channels,
            widths: config.widths,
        })
    }

    /// Looks up the page and register number of a channel's special register.
    pub fn special_register(&self, channel: u8, name: SpecialRegister) -> Result<RegisterAddr> {
        let entry = self.entry(channel)?;
        entry
            .registers
            .get(&name)
            .map(|&reg| RegisterAddr::new(entry.page, reg))
            .ok_or(AssemblyError::UnknownSpecialRegister {
                channel,
                register: name,
            })
    }

    /// Register page holding a channel's special registers.
    pub fn page(&self, channel: u8) -> Result<u8> {
        self.entry(channel).map(|e| e.page)
    }

    /// Effective value width of a special register.
    pub fn width(&self, name: SpecialRegister) -> u32 {
        self.widths.get(&name).copied().unwrap_or(REGISTER_WIDTH)
    }

    pub fn channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.channels.keys().copied()
    }

    fn entry(&self, channel: u8) -> Result<&ChannelEntry> {
        self.channels
            .get(&channel)
            .ok_or(AssemblyError::UnknownChannel(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_pairs_share_a_page() {
        let map = ChannelMap::new(RegisterMapConfig::qsystem2()).unwrap();
        let ch1 = map.special_register(1, SpecialRegister::Freq).unwrap();
        let ch2 = map.special_register(2, SpecialRegister::Freq).unwrap();
        let ch3 = map.special_register(3, SpecialRegister::Freq).unwrap();
        assert_eq!(ch1, RegisterAddr::new(0, 16));
        assert_eq!(ch2, RegisterAddr::new(0, 23));
        assert_eq!(ch3, RegisterAddr::new(1, 16));
        assert_eq!(
            map.special_register(4, SpecialRegister::Time).unwrap(),
            RegisterAddr::new(1, 28)
        );
        assert_eq!(map.width(SpecialRegister::Phase), 16);
        assert_eq!(map.width(SpecialRegister::Mode), 32);
    }

    #[test]
    fn unknown_channel_is_reported() {
        let map = ChannelMap::new(RegisterMapConfig::qsystem2()).unwrap();
        assert_eq!(
            map.special_register(8, SpecialRegister::Gain),
            Err(AssemblyError::UnknownChannel(8))
        );
    }

    #[test]
    fn map_round_trips_through_json() {
        let config = RegisterMapConfig::qsystem2();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"t\""));
        assert_eq!(RegisterMapConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn injected_map_with_other_layout() {
        let json = r#"{
            "channels": [
                {"channel": 0, "page": 3, "registers": {"freq": 5, "gain": 6, "t": 7}}
            ]
        }"#;
        let map = ChannelMap::new(RegisterMapConfig::from_json(json).unwrap()).unwrap();
        assert_eq!(
            map.special_register(0, SpecialRegister::Time).unwrap(),
            RegisterAddr::new(3, 7)
        );
        assert!(matches!(
            map.special_register(0, SpecialRegister::Phase),
            Err(AssemblyError::UnknownSpecialRegister { channel: 0, .. })
        ));
    }

    #[test]
    fn aliasing_registers_are_rejected() {
        let mut config = RegisterMapConfig::qsystem2();
        config.channels[1].registers.insert(SpecialRegister::Freq, 16);
        assert!(matches!(
            ChannelMap::new(config),
            Err(AssemblyError::InvalidRegisterMap(_))
        ));
    }

    #[test]
    fn out_of_range_page_is_rejected() {
        let mut config = RegisterMapConfig::qsystem2();
        config.channels[0].page = 8;
        assert!(ChannelMap::new(config).is_err());
    }
}
