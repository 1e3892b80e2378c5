//! A toy station: one receiver process feeds every board of a shared sample
//! buffer, one consumer process reads all boards in lockstep.
//!
//! ```text
//! cargo run --example station -- writer   # in one terminal
//! cargo run --example station -- reader   # in another
//! cargo run --example station -- both     # or both, as threads
//! ```

use std::env;
use std::thread;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use sample_buffer::{BoardOptions, BufferSettings, Handoff, SampleBuffer, Timestamp};

const KEY: i32 = 0x5354_4e00;
const NR_BOARDS: u32 = 4;
const NR_BEAMLETS: u32 = 61;
const NR_SAMPLES: u64 = 16 * 1024;

/// Samples per received packet.
const PACKET: i64 = 16;
/// Samples per consumer integration block.
const BLOCK: i64 = 1024;
const STREAM_LEN: Timestamp = 256 * BLOCK;

/// One complex voltage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Sample {
    re: i16,
    im: i16,
}

impl Sample {
    fn expected(board: usize, beamlet: usize, ts: Timestamp) -> Self {
        Self {
            re: (ts as i16).wrapping_add(board as i16),
            im: beamlet as i16,
        }
    }
}

fn settings() -> BufferSettings {
    BufferSettings::new(NR_BOARDS, NR_BEAMLETS, NR_SAMPLES)
        .with_sync(true)
        .with_key(KEY)
}

fn main() -> sample_buffer::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} writer|reader|both", args[0]);
        std::process::exit(1);
    }

    match args[1].as_str() {
        "writer" => writer(),
        "reader" => reader(),
        "both" => {
            let sender = thread::spawn(writer);
            let receiver = thread::spawn(reader);
            for handle in [receiver, sender] {
                match handle.join() {
                    Ok(res) => res?,
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            Ok(())
        }
        _ => {
            eprintln!("Usage: {} writer|reader|both", args[0]);
            std::process::exit(1);
        }
    }
}

/// Receiver: one thread per board, each writing packets as they "arrive".
fn writer() -> sample_buffer::Result<()> {
    let buffer = SampleBuffer::<Sample>::create(settings())?;
    tracing::info!(key = KEY, "writer: segment created");
    let start = Instant::now();

    thread::scope(|s| {
        let workers: Vec<_> = buffer
            .boards()
            .map(|board| {
                s.spawn(move || -> sample_buffer::Result<()> {
                    let i = board.index();
                    let mut packet = [Sample::default(); PACKET as usize];
                    for begin in (0..STREAM_LEN).step_by(PACKET as usize) {
                        let end = begin + PACKET;
                        if board.start_write(begin, end)?.is_eos() {
                            tracing::warn!(board = i, begin, "reader gone");
                            board.stop_write(begin)?;
                            break;
                        }
                        for beamlet in 0..NR_BEAMLETS as usize {
                            for (k, sample) in packet.iter_mut().enumerate() {
                                *sample = Sample::expected(i, beamlet, begin + k as i64);
                            }
                            board.write_samples(beamlet, begin, &packet);
                        }
                        board.stop_write(end)?;
                    }
                    board.no_more_writing();
                    Ok(())
                })
            })
            .collect();
        workers
            .into_iter()
            .try_for_each(|w| w.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
    })?;

    tracing::info!(elapsed = ?start.elapsed(), samples = STREAM_LEN, "writer: done");
    Ok(())
}

/// Consumer: reads the same block from every board before moving on.
fn reader() -> sample_buffer::Result<()> {
    let buffer = SampleBuffer::<Sample>::attach_timeout(settings(), Duration::from_secs(10))?
        .with_options(BoardOptions::default().with_wait_timeout(Duration::from_secs(5)));
    tracing::info!(key = KEY, "reader: attached");

    let start = Instant::now();
    let mut out = vec![Sample::default(); BLOCK as usize];
    let mut blocks = 0u64;
    let mut mismatches = 0u64;
    let mut begin: Timestamp = 0;

    'stream: loop {
        let end = begin + BLOCK;
        for board in buffer.boards() {
            if board.start_read(begin, end)? == Handoff::EndOfStream {
                break 'stream;
            }
        }
        for board in buffer.boards() {
            let i = board.index();
            for beamlet in 0..NR_BEAMLETS as usize {
                board.read_samples(beamlet, begin, &mut out);
                mismatches += out
                    .iter()
                    .enumerate()
                    .filter(|&(k, s)| *s != Sample::expected(i, beamlet, begin + k as i64))
                    .count() as u64;
            }
            board.stop_read(end)?;
        }
        blocks += 1;
        begin = end;
    }

    for board in buffer.boards() {
        board.no_more_reading();
    }
    tracing::info!(
        blocks,
        mismatches,
        elapsed = ?start.elapsed(),
        "reader: end of stream"
    );
    if mismatches != 0 {
        tracing::error!(mismatches, "reader: corrupted samples");
        std::process::exit(2);
    }
    Ok(())
}
