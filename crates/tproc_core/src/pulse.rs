use crate::channels::{ChannelMap, RegisterAddr, SpecialRegister};
use crate::program::{Instruction, Program};
use crate::{AssemblyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest delay a single `synci` is used for.
pub const MAX_SYNC: i64 = (1 << 14) - 1;

/// Envelope lengths must stay below this (16-bit field of the mode word).
pub const MAX_LENGTH: u32 = 1 << 16;

/// Output channel driving the trigger/marker lines.
pub const TRIGGER_CHANNEL: u8 = 0;

/// Scratch register holding the trigger output pattern.
pub const TRIGGER_REGISTER: RegisterAddr = RegisterAddr::new(0, 31);

/// Bit of the first readout trigger in the trigger output word.
pub const ADC_TRIGGER_BIT: u32 = 14;

/// Number of readout trigger lines.
pub const NUM_ADC_TRIGGERS: u8 = 2;

/// Extra cycles the readout trigger stays high after the pulse ends.
pub const TRIGGER_TAIL: i64 = 10;

/// Signal source of a generator channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSelect {
    /// Envelope times DDS.
    Product,
    /// DDS only.
    Dds,
    /// Envelope only.
    Input,
    Zero,
}

impl OutputSelect {
    pub fn code(self) -> u32 {
        match self {
            OutputSelect::Product => 0,
            OutputSelect::Dds => 1,
            OutputSelect::Input => 2,
            OutputSelect::Zero => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum PulseStyle {
    /// Constant amplitude from the DDS.
    Const,
    /// Arbitrary envelope stored at `addr`.
    Arb,
    /// Envelope ramp up, constant plateau, envelope ramp down.
    FlatTop { ramp_length: u32 },
}

fn default_stdysel() -> bool {
    true
}

/// Parameters of one pulse on one channel.
///
/// Frequency, phase and gain are raw register values; they must fit the
/// register width the channel map declares for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseDescriptor {
    pub channel: u8,
    pub name: String,
    #[serde(flatten)]
    pub style: PulseStyle,
    pub freq: i64,
    pub phase: i64,
    pub gain: i64,
    /// Envelope memory address.
    #[serde(default)]
    pub addr: i64,
    /// Plateau length for flat-top pulses, full length otherwise.
    pub length: u32,
    /// Reset the DDS phase at pulse start.
    #[serde(default)]
    pub phrst: bool,
    /// Hold the last sample after the pulse instead of outputting zero.
    #[serde(default = "default_stdysel")]
    pub stdysel: bool,
    /// Repeat the pulse until the next `set`.
    #[serde(default)]
    pub periodic: bool,
}

impl PulseDescriptor {
    /// A constant-amplitude pulse with default mode bits.
    pub fn constant(channel: u8, name: impl Into<String>, freq: i64, gain: i64, length: u32) -> Self {
        Self {
            channel,
            name: name.into(),
            style: PulseStyle::Const,
            freq,
            phase: 0,
            gain,
            addr: 0,
            length,
            phrst: false,
            stdysel: true,
            periodic: false,
        }
    }

    /// Total time the pulse occupies its channel.
    pub fn duration(&self) -> i64 {
        match self.style {
            PulseStyle::FlatTop { ramp_length } => {
                i64::from(self.length) + 2 * i64::from(ramp_length / 2)
            }
            _ => i64::from(self.length),
        }
    }

    fn mode_for(&self, outsel: OutputSelect, length: u32) -> Result<u32> {
        mode_code(self.phrst, self.stdysel, self.periodic, outsel, length)
            .ok_or_else(|| self.invalid(format!("length {length} must be below {MAX_LENGTH}")))
    }

    fn invalid(&self, reason: String) -> AssemblyError {
        AssemblyError::InvalidPulse {
            name: self.name.clone(),
            reason,
        }
    }
}

/// Packs the generator mode word.
///
/// The upper half holds `phrst·16 + stdysel·8 + periodic·4 + outsel`, the
/// lower 16 bits the envelope length. Returns `None` when `length` does not
/// fit in 16 bits.
pub fn mode_code(
    phrst: bool,
    stdysel: bool,
    periodic: bool,
    outsel: OutputSelect,
    length: u32,
) -> Option<u32> {
    if length >= MAX_LENGTH {
        return None;
    }
    let flags = u32::from(phrst) * 0b10000
        + u32::from(stdysel) * 0b01000
        + u32::from(periodic) * 0b00100
        + outsel.code();
    Some(flags << 16 | length)
}

/// Pulse start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Right after the previous pulse on the same channel.
    Auto,
    At(i64),
}

/// Timeline macros over a program.
///
/// Tracks, per channel, the time at which the last scheduled pulse ends so
/// that pulses played with [`Start::Auto`] follow each other without gaps.
/// All times are relative to the current sync point; `sync_all` and `delay`
/// move the sync point and reset the timestamps.
pub struct Sequencer<'a> {
    prog: &'a mut Program,
    map: &'a ChannelMap,
    timestamps: BTreeMap<u8, i64>,
}

impl<'a> Sequencer<'a> {
    pub fn new(prog: &'a mut Program, map: &'a ChannelMap) -> Self {
        Self {
            prog,
            map,
            timestamps: BTreeMap::new(),
        }
    }

    pub fn program(&mut self) -> &mut Program {
        self.prog
    }

    pub fn map(&self) -> &ChannelMap {
        self.map
    }

    /// End time of the last pulse scheduled on `channel`.
    pub fn timestamp(&self, channel: u8) -> i64 {
        self.timestamps.get(&channel).copied().unwrap_or(0)
    }

    /// Writes frequency, phase and gain, and for single-segment pulses the
    /// envelope address and mode word, into the channel's special registers.
    pub fn setup(&mut self, pulse: &PulseDescriptor) -> Result<()> {
        self.atomic(|seq| seq.emit_setup(pulse))
    }

    fn emit_setup(&mut self, pulse: &PulseDescriptor) -> Result<()> {
        self.write(pulse, SpecialRegister::Freq, pulse.freq)?;
        self.write(pulse, SpecialRegister::Phase, pulse.phase)?;
        self.write(pulse, SpecialRegister::Gain, pulse.gain)?;
        match pulse.style {
            PulseStyle::Const => {
                let mode = pulse.mode_for(OutputSelect::Dds, pulse.length)?;
                self.write(pulse, SpecialRegister::Addr, 0)?;
                self.write(pulse, SpecialRegister::Mode, i64::from(mode))?;
            }
            PulseStyle::Arb => {
                let mode = pulse.mode_for(OutputSelect::Product, pulse.length)?;
                self.write(pulse, SpecialRegister::Addr, pulse.addr)?;
                self.write(pulse, SpecialRegister::Mode, i64::from(mode))?;
            }
            // Address and mode change per segment; written by `play`.
            PulseStyle::FlatTop { .. } => {}
        }
        Ok(())
    }

    /// Schedules a pulse whose registers were written by [`Self::setup`].
    ///
    /// # Returns
    ///
    /// The start time the pulse was scheduled at.
    pub fn play(&mut self, pulse: &PulseDescriptor, start: Start) -> Result<i64> {
        self.atomic(|seq| seq.emit_play(pulse, start))
    }

    fn emit_play(&mut self, pulse: &PulseDescriptor, start: Start) -> Result<i64> {
        let t = match start {
            Start::Auto => self.timestamp(pulse.channel),
            Start::At(t) => t,
        };

        match pulse.style {
            PulseStyle::Const | PulseStyle::Arb => self.emit_set(pulse, t)?,
            PulseStyle::FlatTop { ramp_length } => {
                let half = ramp_length / 2;
                if half == 0 {
                    return Err(pulse.invalid(format!("ramp of {ramp_length} samples is too short")));
                }
                let segments = [
                    (pulse.addr, half, OutputSelect::Product),
                    (0, pulse.length, OutputSelect::Dds),
                    (pulse.addr + i64::from(half), half, OutputSelect::Product),
                ];
                let mut at = t;
                for (addr, length, outsel) in segments {
                    let mode = pulse.mode_for(outsel, length)?;
                    self.write(pulse, SpecialRegister::Addr, addr)?;
                    self.write(pulse, SpecialRegister::Mode, i64::from(mode))?;
                    self.emit_set(pulse, at)?;
                    at += i64::from(length);
                }
            }
        }

        self.timestamps.insert(pulse.channel, t + pulse.duration());
        Ok(t)
    }

    /// [`Self::setup`] followed by [`Self::play`].
    pub fn pulse(&mut self, pulse: &PulseDescriptor, start: Start) -> Result<i64> {
        self.atomic(|seq| {
            seq.emit_setup(pulse)?;
            seq.emit_play(pulse, start)
        })
    }

    /// Moves the sync point past every scheduled pulse plus `extra` cycles.
    pub fn sync_all(&mut self, extra: i64) {
        let max_t = self.timestamps.values().copied().max().unwrap_or(0);
        if max_t + extra > 0 {
            self.prog.synci(max_t + extra);
            self.timestamps.clear();
        }
    }

    /// Syncs all channels, then waits `cycles` more, split into `synci`
    /// steps of at most [`MAX_SYNC`].
    pub fn delay(&mut self, cycles: i64) {
        self.sync_all(0);
        let mut remaining = cycles;
        while remaining > MAX_SYNC {
            self.prog.synci(MAX_SYNC);
            remaining -= MAX_SYNC;
        }
        if remaining > 0 {
            self.prog.synci(remaining);
        }
    }

    /// Raises the given readout triggers and marker pins at `t` and lowers
    /// them `width` cycles later.
    pub fn trigger(&mut self, adcs: &[u8], pins: &[u8], t: i64, width: i64) -> Result<()> {
        let invalid = |reason: String| AssemblyError::InvalidPulse {
            name: "trigger".into(),
            reason,
        };
        let mut out = 0u32;
        for &adc in adcs {
            if adc >= NUM_ADC_TRIGGERS {
                return Err(invalid(format!("no readout trigger {adc}")));
            }
            out |= 1 << (ADC_TRIGGER_BIT + u32::from(adc));
        }
        for &pin in pins {
            if u32::from(pin) >= ADC_TRIGGER_BIT {
                return Err(invalid(format!("no marker pin {pin}")));
            }
            out |= 1 << pin;
        }
        if width <= 0 {
            return Err(invalid(format!("width {width}")));
        }

        let RegisterAddr { page, reg } = TRIGGER_REGISTER;
        self.prog.append_with_comment(
            Instruction::Regwi {
                page,
                reg,
                imm: i64::from(out),
            },
            format!("out = {out:#018b}"),
        );
        self.prog.append_with_comment(
            Instruction::Seti {
                ch: TRIGGER_CHANNEL,
                page,
                reg,
                t,
            },
            format!("ch = {TRIGGER_CHANNEL} out = ${reg} @t = {t}"),
        );
        self.prog.append_with_comment(
            Instruction::Seti {
                ch: TRIGGER_CHANNEL,
                page,
                reg: 0,
                t: t + width,
            },
            format!("ch = {TRIGGER_CHANNEL} out = 0 @t = {}", t + width),
        );
        Ok(())
    }

    /// Plays a readout pulse and triggers the given readouts around it.
    ///
    /// The trigger rises `trig_offset` cycles after the pulse start and stays
    /// high for the pulse length plus [`TRIGGER_TAIL`].
    pub fn measure(
        &mut self,
        pulse: &PulseDescriptor,
        adcs: &[u8],
        trig_offset: i64,
        start: Start,
    ) -> Result<i64> {
        let t = match start {
            Start::Auto => self.timestamp(pulse.channel),
            Start::At(t) => t,
        };
        self.atomic(|seq| {
            seq.trigger(adcs, &[], t + trig_offset, pulse.duration() + TRIGGER_TAIL)?;
            seq.emit_setup(pulse)?;
            seq.emit_play(pulse, Start::At(t))
        })
    }

    /// Runs `emit`, discarding whatever it appended if it fails.
    fn atomic<T>(&mut self, emit: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let checkpoint = self.prog.checkpoint();
        let result = emit(self);
        if result.is_err() {
            self.prog.rollback(checkpoint);
        }
        result
    }

    fn write(&mut self, pulse: &PulseDescriptor, name: SpecialRegister, value: i64) -> Result<()> {
        let addr = self.map.special_register(pulse.channel, name)?;
        let width = self.map.width(name);
        if value < 0 || value >= 1i64 << width {
            return Err(pulse.invalid(format!("{name} = {value} does not fit in {width} bits")));
        }
        let comment = format!("{name} = {value}");
        self.prog
            .safe_regwi(addr.page, addr.reg, value, Some(comment.as_str()));
        Ok(())
    }

    fn emit_set(&mut self, pulse: &PulseDescriptor, t: i64) -> Result<()> {
        self.write(pulse, SpecialRegister::Time, t)?;
        let ch = pulse.channel;
        let map = self.map;
        let reg = |name| map.special_register(ch, name).map(|a| a.reg);
        let instruction = Instruction::Set {
            ch,
            page: map.page(ch)?,
            freq: reg(SpecialRegister::Freq)?,
            phase: reg(SpecialRegister::Phase)?,
            addr: reg(SpecialRegister::Addr)?,
            gain: reg(SpecialRegister::Gain)?,
            mode: reg(SpecialRegister::Mode)?,
            t: reg(SpecialRegister::Time)?,
        };
        self.prog
            .append_with_comment(instruction, format!("ch = {ch} {} @t = {t}", pulse.name));
        Ok(())
    }
}
