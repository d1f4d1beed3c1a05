use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tproc_common::dmem::COUNTER_ADDR;
use tproc_hw::Soc;
use tproc_hw::bridge::{BridgeSoc, serve_connection};
use tproc_hw::sim::{SimulatedSoc, TransferRecord};
use tproc_hw::streamer::{Chunk, DataStreamer, StreamConfig, StreamError};

const DEADLINE: Duration = Duration::from_secs(20);

fn busy_poll(stride: Option<usize>) -> StreamConfig {
    StreamConfig {
        stride,
        poll_interval: Duration::ZERO,
        ..StreamConfig::default()
    }
}

fn wait_done<S: Soc + 'static>(streamer: &DataStreamer<S>) {
    let started = Instant::now();
    while !streamer.readout_done() {
        assert!(started.elapsed() < DEADLINE, "readout never finished");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Checks that `chunks` cover samples `0..total` of every channel in order.
fn assert_loss_free(chunks: &[Chunk], channels: &[usize], total: u64, capacity: usize) {
    let mut next = 0u64;
    for chunk in chunks {
        assert_eq!(chunk.stats.address, (next % capacity as u64) as usize);
        assert_eq!(chunk.data.len(), channels.len());
        for (data, &ch) in chunk.data.iter().zip(channels) {
            assert_eq!(data.i.len(), chunk.len());
            assert_eq!(data.q.len(), chunk.len());
            for (k, (i, q)) in data.i.iter().zip(&data.q).enumerate() {
                let expected = SimulatedSoc::sample(ch, next + k as u64);
                assert_eq!((*i, *q), expected, "channel {ch} sample {}", next + k as u64);
            }
        }
        next += chunk.len() as u64;
    }
    assert_eq!(next, total);
}

#[test]
fn steady_counter_drains_in_three_chunks() {
    let soc = Arc::new(SimulatedSoc::new(2048, 1).with_limit(2500));
    let mut streamer = DataStreamer::new(Arc::clone(&soc), busy_poll(Some(1000)));

    streamer.start_readout(2500, COUNTER_ADDR, &[0]).unwrap();
    let chunks = streamer.drain_until_done(DEADLINE).unwrap();

    assert!(chunks.len() <= 3);
    assert_loss_free(&chunks, &[0], 2500, 2048);
    let lengths: Vec<usize> = chunks.iter().map(Chunk::len).collect();
    assert_eq!(lengths, vec![1000, 1000, 500]);

    // the last window crosses the end of the buffer
    let transfers = soc.transfers().unwrap();
    assert_eq!(
        &transfers[transfers.len() - 2..],
        &[
            TransferRecord { ch: 0, address: 2000, length: 48 },
            TransferRecord { ch: 0, address: 0, length: 452 },
        ]
    );
}

#[test]
fn wrapped_buffer_is_an_overflow_without_transfer() {
    let soc = Arc::new(SimulatedSoc::new(64, 1).with_increment(100));
    let mut streamer = DataStreamer::new(Arc::clone(&soc), busy_poll(None));

    streamer.start_readout(1000, COUNTER_ADDR, &[0]).unwrap();
    let err = streamer.drain_until_done(DEADLINE).unwrap_err();

    assert!(matches!(
        err,
        StreamError::Overflow { last_drained: 0, unread: 100, capacity: 64 }
    ));
    assert!(soc.transfers().unwrap().is_empty());
    wait_done(&streamer);
    assert!(!streamer.readout_alive());
}

#[test]
fn overflow_arrives_after_the_data_before_it() {
    let mut steps = vec![10, 100].into_iter();
    let soc = Arc::new(SimulatedSoc::new(64, 1).with_schedule(move || steps.next().unwrap_or(0)));
    let mut streamer = DataStreamer::new(soc, busy_poll(Some(10)));

    streamer.start_readout(1000, COUNTER_ADDR, &[0]).unwrap();
    wait_done(&streamer);

    let chunks = streamer.poll_data().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].len(), 10);
    assert!(matches!(
        streamer.poll_data(),
        Err(StreamError::Overflow { last_drained: 10, unread: 100, .. })
    ));
    assert!(streamer.poll_data().unwrap().is_empty());
}

#[test]
fn random_counter_advance_loses_nothing() {
    let mut rng = StdRng::seed_from_u64(0x7a0c);
    let total = 5000u64;
    let soc = Arc::new(
        SimulatedSoc::new(256, 2)
            .with_limit(total as u32)
            .with_schedule(move || rng.gen_range(0..=40)),
    );
    let mut streamer = DataStreamer::new(soc, busy_poll(Some(25)));

    streamer.start_readout(total, COUNTER_ADDR, &[0, 1]).unwrap();
    let chunks = streamer.drain_until_done(DEADLINE).unwrap();

    assert_loss_free(&chunks, &[0, 1], total, 256);
    assert!(chunks.iter().all(|c| c.len() % 2 == 0));
    assert!(chunks.windows(2).all(|w| w[0].stats.count < w[1].stats.count));
    assert!(chunks.windows(2).all(|w| w[0].stats.elapsed <= w[1].stats.elapsed));
}

#[test]
fn odd_windows_trim_down_until_the_final_one() {
    let soc = Arc::new(SimulatedSoc::new(64, 1).with_increment(3).with_limit(13));
    let mut streamer = DataStreamer::new(Arc::clone(&soc), busy_poll(Some(3)));

    streamer.start_readout(13, COUNTER_ADDR, &[0]).unwrap();
    let chunks = streamer.drain_until_done(DEADLINE).unwrap();

    // counts 3, 6, 9, 12, 13
    let lengths: Vec<usize> = chunks.iter().map(Chunk::len).collect();
    assert_eq!(lengths, vec![2, 4, 2, 4, 1]);
    assert_loss_free(&chunks, &[0], 13, 64);

    // the final odd window reads one padding sample
    let last = soc.transfers().unwrap().pop().unwrap();
    assert_eq!(last, TransferRecord { ch: 0, address: 12, length: 2 });
}

#[test]
fn oversized_stride_still_drains_without_overflow() {
    let soc = Arc::new(SimulatedSoc::new(64, 1).with_limit(200));
    let mut streamer = DataStreamer::new(soc, busy_poll(Some(1000)));
    assert_eq!(streamer.config().stride_for(64), 63);

    streamer.start_readout(200, COUNTER_ADDR, &[0]).unwrap();
    let chunks = streamer.drain_until_done(DEADLINE).unwrap();

    assert_loss_free(&chunks, &[0], 200, 64);
    assert!(chunks.iter().all(|c| c.len() < 64));
}

#[test]
fn idle_streamer_reports_done() {
    let soc = Arc::new(SimulatedSoc::new(64, 1));
    let mut streamer = DataStreamer::new(soc, StreamConfig::default());
    assert!(streamer.readout_done());
    assert!(!streamer.readout_alive());
    assert!(streamer.poll_data().unwrap().is_empty());
}

#[test]
fn counter_is_scaled_by_reads_per_count() {
    let soc = Arc::new(
        SimulatedSoc::new(128, 1)
            .with_samples_per_count(2)
            .with_increment(3)
            .with_limit(100),
    );
    let config = StreamConfig {
        reads_per_count: 2,
        ..busy_poll(Some(16))
    };
    let mut streamer = DataStreamer::new(soc, config);

    streamer.start_readout(200, COUNTER_ADDR, &[0]).unwrap();
    let chunks = streamer.drain_until_done(DEADLINE).unwrap();
    assert_loss_free(&chunks, &[0], 200, 128);
}

#[test]
fn stalled_transfer_reports_hardware_timeout() {
    let soc = Arc::new(SimulatedSoc::new(64, 1).with_stalled_transfers(true));
    let config = StreamConfig {
        transfer_timeout: Duration::from_millis(20),
        ..busy_poll(Some(8))
    };
    let mut streamer = DataStreamer::new(soc, config);

    streamer.start_readout(100, COUNTER_ADDR, &[0]).unwrap();
    let err = streamer.drain_until_done(DEADLINE).unwrap_err();
    assert!(matches!(err, StreamError::HardwareTimeout(t) if t == Duration::from_millis(20)));
}

#[test]
fn second_start_is_rejected_while_alive() {
    // counter never moves, so the worker polls until stopped
    let soc = Arc::new(SimulatedSoc::new(64, 1).with_increment(0));
    let mut streamer = DataStreamer::new(Arc::clone(&soc), StreamConfig::default());

    streamer.start_readout(10, COUNTER_ADDR, &[0]).unwrap();
    assert!(streamer.readout_alive());
    assert!(matches!(
        streamer.start_readout(10, COUNTER_ADDR, &[0]),
        Err(StreamError::AlreadyRunning)
    ));

    streamer.stop_readout();
    wait_done(&streamer);
    assert!(!streamer.readout_alive());
    assert!(streamer.poll_data().unwrap().is_empty());

    streamer.start_readout(10, COUNTER_ADDR, &[0]).unwrap();
    assert!(streamer.readout_alive());
    streamer.stop_readout();
    wait_done(&streamer);
    assert_eq!(soc.starts().unwrap(), 2);
}

#[test]
fn stop_keeps_what_was_already_delivered() {
    let soc = Arc::new(SimulatedSoc::new(4096, 1).with_increment(1));
    let mut streamer = DataStreamer::new(soc, busy_poll(Some(64)));

    streamer.start_readout(u64::from(u32::MAX), COUNTER_ADDR, &[0]).unwrap();
    let chunks = streamer.drain_until_done(Duration::from_millis(50)).unwrap();

    let mut next = 0u64;
    for chunk in &chunks {
        assert_eq!(chunk.data[0].i[0], SimulatedSoc::sample(0, next).0);
        next += chunk.len() as u64;
    }
    assert!(next < u64::from(u32::MAX));
    assert!(streamer.readout_done());
}

#[test]
fn readout_over_tcp_bridge() {
    let soc = Arc::new(SimulatedSoc::new(512, 2).with_increment(7).with_limit(1500));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let board = Arc::clone(&soc);
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        serve_connection(stream, board.as_ref()).unwrap();
    });

    let bridge = Arc::new(BridgeSoc::connect(addr).unwrap());
    let mut streamer = DataStreamer::new(bridge, busy_poll(None));
    streamer.start_readout(1500, COUNTER_ADDR, &[1, 0]).unwrap();
    let chunks = streamer.drain_until_done(DEADLINE).unwrap();

    assert_loss_free(&chunks, &[1, 0], 1500, 512);
}

#[test]
fn averaging_program_drives_the_readout() {
    use tproc_core::averager::{AveragerConfig, build_averager};
    use tproc_core::channels::{ChannelMap, RegisterMapConfig};
    use tproc_core::pulse::{PulseDescriptor, Start};

    let map = ChannelMap::new(RegisterMapConfig::qsystem2()).unwrap();
    let pulse = PulseDescriptor::constant(7, "readout", 1000, 5000, 100);
    let built = build_averager(&AveragerConfig::new(300), &map, |_| Ok(()), |seq| {
        seq.measure(&pulse, &[0], 50, Start::Auto)?;
        seq.sync_all(100);
        Ok(())
    })
    .unwrap();

    let soc = Arc::new(
        SimulatedSoc::new(128, 1)
            .with_increment(5)
            .with_limit(built.total_count as u32)
            .with_counter_addr(built.counter_addr),
    );
    soc.load_program(&built.encode().unwrap()).unwrap();
    assert_eq!(soc.program().unwrap().len(), built.program.len());

    let mut streamer = DataStreamer::new(Arc::clone(&soc), busy_poll(None));
    streamer
        .start_readout(built.total_count, built.counter_addr, &[0])
        .unwrap();
    let chunks = streamer.drain_until_done(DEADLINE).unwrap();
    assert_loss_free(&chunks, &[0], 300, 128);
}
