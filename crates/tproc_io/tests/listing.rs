use tproc_core::averager::{AveragerConfig, build_averager};
use tproc_core::channels::{ChannelMap, RegisterAddr, RegisterMapConfig, SpecialRegister};
use tproc_core::program::Program;
use tproc_core::pulse::{PulseDescriptor, Start};
use tproc_core::sweep::{SweepDescriptor, SweptRegister};
use tproc_io::{compare_programs, parse_program, parse_words};

fn swept_averager() -> Program {
    let map = ChannelMap::new(RegisterMapConfig::qsystem2()).unwrap();
    let gain = map.special_register(7, SpecialRegister::Gain).unwrap();
    let expts = SweepDescriptor::new("LOOP_I", 11, RegisterAddr::new(3, 14))
        .sweep(SweptRegister::new(gain, -3000, 600));
    let config = AveragerConfig::new(1000).with_expts(expts);
    let pulse = PulseDescriptor::constant(7, "readout", 100_000, 0, 400);

    build_averager(
        &config,
        &map,
        |seq| seq.setup(&pulse),
        |seq| {
            seq.measure(&pulse, &[0, 1], 200, Start::Auto)?;
            seq.sync_all(1000);
            seq.delay(40_000);
            Ok(())
        },
    )
    .unwrap()
    .program
}

#[test]
fn assembly_listing_reassembles_to_identical_words() {
    let prog = swept_averager();
    let listing = prog.asm();

    let parsed = parse_program(&listing).unwrap();
    assert_eq!(parsed.len(), prog.len());
    assert!(compare_programs(&parsed.encode().unwrap(), &prog.encode().unwrap()).is_empty());
    assert_eq!(parsed.asm(), listing);
}

#[test]
fn hex_and_bin_listings_load_back() {
    let prog = swept_averager();
    let words = prog.encode().unwrap();
    assert_eq!(parse_words(&prog.hex().unwrap()).unwrap(), words);
    assert_eq!(parse_words(&prog.bin().unwrap()).unwrap(), words);
}

#[test]
fn hand_written_listing_assembles() {
    let text = "\
// countdown
        regwi 0, $14, 3;
LOOP:   mathi 0, $14, $14 - 1;   // decrement
        condj 0, $14, >, $0, @LOOP;
        memwi 0, $14, 1;
        end;
";
    let prog = parse_program(text).unwrap();
    let words = prog.encode().unwrap();
    assert_eq!(words.len(), 5);
    assert_eq!(prog.label_pc("LOOP"), Some(1));
    assert_eq!(words[2] & 0xFFFF, 1);
}

#[test]
fn multi_line_comments_survive_the_listing() {
    let mut prog = Program::new();
    prog.define_label("start_2").unwrap();
    prog.safe_regwi(0, 3, 5, Some("gain\nsweep"));
    prog.end();

    let parsed = parse_program(&prog.asm()).unwrap();
    assert_eq!(parsed.encode().unwrap(), prog.encode().unwrap());
    assert_eq!(parsed.label_pc("start_2"), Some(0));
    assert_eq!(parsed.statements()[0].comment.as_deref(), Some("gain sweep"));
    assert!(prog.define_label("gain-sweep").is_err());
}
