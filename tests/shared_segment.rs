//! Create/attach over SysV shared memory.

use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use sample_buffer::{
    Arena, BufferSettings, Error, Handoff, LAYOUT_VERSION, MAGIC, SampleBuffer, SharedMemoryArena,
};

/// Keys private to this test binary and process.
fn unique_key() -> i32 {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    0x5400_0000 | ((process::id() as i32 & 0x7fff) << 8) | (n as i32 & 0xff)
}

fn settings() -> BufferSettings {
    BufferSettings::new(2, 3, 128).with_sync(true).with_key(unique_key())
}

#[test]
fn writer_and_reader_on_separate_mappings() {
    let settings = settings();
    let creator = SampleBuffer::<[i16; 2]>::create(settings).unwrap();
    let attached = SampleBuffer::<[i16; 2]>::attach(settings).unwrap();
    assert!(creator.is_creator());
    assert!(!attached.is_creator());

    let writer = creator.board(1);
    let reader = attached.board(1);
    let sample = |ts: i64, beamlet: usize| [ts as i16, beamlet as i16];

    thread::scope(|s| {
        s.spawn(move || {
            for chunk in 0..20i64 {
                let (begin, end) = (chunk * 50, chunk * 50 + 50);
                assert_eq!(writer.start_write(begin, end).unwrap(), Handoff::Ready);
                for beamlet in 0..3 {
                    let samples: Vec<_> = (begin..end).map(|ts| sample(ts, beamlet)).collect();
                    writer.write_samples(beamlet, begin, &samples);
                }
                writer.stop_write(end).unwrap();
            }
            writer.no_more_writing();
        });

        let mut begin = 0i64;
        let mut out = [[0i16; 2]; 40];
        while reader.start_read(begin, begin + 40).unwrap().is_ready() {
            for beamlet in 0..3 {
                reader.read_samples(beamlet, begin, &mut out);
                for (i, s) in out.iter().enumerate() {
                    assert_eq!(*s, sample(begin + i as i64, beamlet));
                }
            }
            reader.stop_read(begin + 40).unwrap();
            begin += 40;
        }
        assert_eq!(begin, 1000);
    });

    // The other board never moved.
    assert_eq!(attached.board(0).published_end(), None);
    assert_eq!(reader.read_pointer(), 1000);
}

#[test]
fn attach_rejects_every_geometry_mismatch() {
    let settings = settings();
    let _creator = SampleBuffer::<u32>::create(settings).unwrap();

    let cases = [
        ("nr_boards", BufferSettings { nr_boards: 3, ..settings }),
        (
            "nr_beamlets_per_board",
            BufferSettings {
                nr_beamlets_per_board: 1,
                ..settings
            },
        ),
        ("nr_samples", BufferSettings { nr_samples: 64, ..settings }),
        ("sync", settings.with_sync(false)),
    ];
    for (field, theirs) in cases {
        match SampleBuffer::<u32>::attach(theirs) {
            Err(Error::ConfigMismatch { field: f, .. }) => assert_eq!(f, field),
            other => panic!("{field}: expected mismatch, got {other:?}"),
        }
    }

    match SampleBuffer::<u64>::attach(settings) {
        Err(Error::ConfigMismatch {
            field: "sample_size",
            ours: 8,
            theirs: 4,
        }) => {}
        other => panic!("expected sample size mismatch, got {other:?}"),
    }
}

#[test]
fn attach_checks_magic_before_anything_else() {
    let key = unique_key();
    let settings = BufferSettings::new(1, 1, 16).with_key(key);
    let size = SampleBuffer::<u32>::data_size(&settings).unwrap();
    let raw = SharedMemoryArena::create(key, size).unwrap();

    // Nothing written yet.
    assert!(matches!(SampleBuffer::<u32>::attach(settings), Err(Error::NotInitialized)));

    unsafe { raw.as_ptr().cast::<u64>().write(0xdead_beef) };
    assert!(matches!(SampleBuffer::<u32>::attach(settings), Err(Error::InvalidMagic)));

    unsafe {
        raw.as_ptr().cast::<u64>().write(MAGIC);
        raw.as_ptr().add(8).cast::<u32>().write(LAYOUT_VERSION + 1);
    }
    match SampleBuffer::<u32>::attach(settings) {
        Err(Error::IncompatibleVersion { expected, found }) => {
            assert_eq!(expected, LAYOUT_VERSION);
            assert_eq!(found, LAYOUT_VERSION + 1);
        }
        other => panic!("expected version error, got {other:?}"),
    }
}

#[test]
fn attach_to_missing_segment_fails() {
    let settings = settings();
    match SampleBuffer::<u32>::attach(settings) {
        Err(Error::SharedMemory { key, .. }) => assert_eq!(key, settings.shared_memory_key),
        other => panic!("expected shared memory error, got {other:?}"),
    }
}

#[test]
fn attach_timeout_waits_for_creator() {
    let settings = settings();
    thread::scope(|s| {
        let attacher =
            s.spawn(|| SampleBuffer::<u32>::attach_timeout(settings, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        let creator = SampleBuffer::<u32>::create(settings).unwrap();
        let attached = attacher.join().unwrap().unwrap();
        assert_eq!(attached.settings(), creator.settings());
    });

    let missing = settings.with_key(unique_key());
    assert!(matches!(
        SampleBuffer::<u32>::attach_timeout(missing, Duration::from_millis(30)),
        Err(Error::SharedMemory { .. })
    ));
}

#[test]
fn kept_segment_outlives_creator_and_stale_one_is_replaced() {
    let settings = settings();
    {
        let mut creator = SampleBuffer::<u32>::create(settings).unwrap();
        let board = creator.board(0);
        let _ = board.start_write(0, 4).unwrap();
        board.write_samples(2, 0, &[4, 3, 2, 1]);
        board.stop_write(4).unwrap();
        creator.keep_segment();
    }

    {
        let attached = SampleBuffer::<u32>::attach(settings).unwrap();
        let mut out = [0u32; 4];
        attached.board(0).read_samples(2, 0, &mut out);
        assert_eq!(out, [4, 3, 2, 1]);
        assert_eq!(attached.board(0).write_pointer(), 4);
    }

    // A new creator starts from a clean segment and removes it on drop.
    {
        let creator = SampleBuffer::<u32>::create(settings).unwrap();
        assert_eq!(creator.board(0).published_end(), None);
        assert!(creator.board(0).available().is_empty());
    }
    assert!(matches!(
        SampleBuffer::<u32>::attach(settings),
        Err(Error::SharedMemory { .. })
    ));
}
