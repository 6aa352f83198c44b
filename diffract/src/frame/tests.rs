use super::*;

fn numbered_frames(rows: usize, cols: usize, count: usize) -> Vec<Vec<u32>> {
    (0..count)
        .map(|f| (0..rows * cols).map(|i| (f * 1000 + i) as u32).collect())
        .collect()
}

fn memory_dataset(count: usize) -> (Arc<MemoryFrameSource>, Dataset) {
    let source = Arc::new(MemoryFrameSource::new(4, 5, numbered_frames(4, 5, count)));
    let dataset = Dataset::new("numbered", Arc::clone(&source) as Arc<dyn FrameSource>);
    (source, dataset)
}

#[test]
fn test_open_guard_closes_source() {
    let (source, dataset) = memory_dataset(3);
    {
        let open = dataset.open().expect("open");
        assert_eq!(source.open_sessions(), 1);
        assert_eq!(open.frame_count(), 3);
        assert_eq!(open.shape(), (4, 5));
    }
    assert_eq!(source.open_sessions(), 0);
}

#[test]
fn test_frame_out_of_range() {
    let (_, dataset) = memory_dataset(3);
    let open = dataset.open().expect("open");
    match open.frame(3) {
        Err(Error::FrameIndex { index, count }) => {
            assert_eq!(index, 3);
            assert_eq!(count, 3);
        }
        other => panic!("expected FrameIndex error, got {other:?}"),
    }
}

#[test]
fn test_frames_are_cached_and_shared() {
    let (source, dataset) = memory_dataset(3);
    let open = dataset.open().expect("open");
    let a = open.frame(1).expect("frame 1");
    let b = open.frame(1).expect("frame 1 again");
    assert_eq!(a, b);
    assert_eq!(source.reads(), 1);
    assert_eq!(open.cached_frames(), 1);
    assert_eq!(a.get(2, 1), 1000 + 7);

    open.clear_cache();
    assert_eq!(open.cached_frames(), 0);
}

#[test]
fn test_streaming_does_not_fill_the_cache() {
    let (source, dataset) = memory_dataset(30);
    let open = dataset.open().expect("open");
    for mode in [IterationMode::ReadAhead, IterationMode::Synchronous] {
        let count = open.frames(mode, 0..30).filter(|f| f.is_ok()).count();
        assert_eq!(count, 30);
        assert_eq!(open.cached_frames(), 0, "{mode:?}");
    }
    assert_eq!(source.reads(), 60);

    // A randomly accessed frame is served from the cache while streaming.
    open.frame(4).expect("frame 4");
    let streamed: Vec<usize> = open
        .frames(IterationMode::Synchronous, 3..6)
        .map(|f| f.expect("frame").index())
        .collect();
    assert_eq!(streamed, vec![3, 4, 5]);
    assert_eq!(source.reads(), 61 + 2);
}

#[test]
fn test_cache_is_bounded() {
    let (source, dataset) = memory_dataset(30);
    let dataset = dataset.with_cache_capacity(4);
    let open = dataset.open().expect("open");
    for i in 0..30 {
        open.frame(i).expect("frame");
        assert!(open.cached_frames() <= 4, "cached {}", open.cached_frames());
    }
    assert_eq!(open.cached_frames(), 4);

    // The newest frames survive, the oldest were evicted.
    let reads = source.reads();
    open.frame(29).expect("cached");
    assert_eq!(source.reads(), reads);
    open.frame(0).expect("evicted");
    assert_eq!(source.reads(), reads + 1);
}

#[test]
fn test_zero_capacity_disables_the_cache() {
    let (source, dataset) = memory_dataset(3);
    let open = dataset.with_cache_capacity(0).open().expect("open");
    open.frame(1).expect("frame");
    open.frame(1).expect("frame");
    assert_eq!(open.cached_frames(), 0);
    assert_eq!(source.reads(), 2);
}

#[test]
fn test_synchronous_and_read_ahead_yield_identical_frames() {
    let (_, dataset) = memory_dataset(12);
    let sync: Vec<Frame> = {
        let open = dataset.open().expect("open");
        open.frames(IterationMode::Synchronous, 0..12)
            .collect::<Result<_>>()
            .expect("sync iteration")
    };
    let ahead: Vec<Frame> = {
        let open = dataset.open().expect("open");
        open.frames(IterationMode::ReadAhead, 0..12)
            .collect::<Result<_>>()
            .expect("read-ahead iteration")
    };
    assert_eq!(sync.len(), 12);
    assert_eq!(sync, ahead);
    for (i, frame) in ahead.iter().enumerate() {
        assert_eq!(frame.index(), i, "frames must not be reordered");
    }
}

#[test]
fn test_frame_range_is_clamped() {
    let (_, dataset) = memory_dataset(5);
    let open = dataset.open().expect("open");
    let indices: Vec<usize> = open
        .frames(IterationMode::ReadAhead, 3..99)
        .map(|f| f.expect("frame").index())
        .collect();
    assert_eq!(indices, vec![3, 4]);
    assert_eq!(open.frames(IterationMode::Synchronous, 7..9).count(), 0);
}

#[test]
fn test_dropping_read_ahead_iterator_early_stops_worker() {
    let (source, dataset) = memory_dataset(20);
    let open = dataset.open().expect("open");
    {
        let mut iter = open.frames(IterationMode::ReadAhead, 0..20);
        assert_eq!(iter.next().expect("first").expect("ok").index(), 0);
        assert_eq!(iter.position(), 1);
    }
    // At most the consumed frame plus one frame in flight.
    assert!(source.reads() <= 2, "read {} frames", source.reads());
}

#[test]
fn test_frame_shape_mismatch_is_reported() {
    let frames = vec![vec![0u32; 20], vec![0u32; 12]];
    let source = Arc::new(MemoryFrameSource::new(4, 5, frames));
    let dataset = Dataset::new("bad", source);
    let open = dataset.open().expect("open");
    assert!(open.frame(0).is_ok());
    assert!(matches!(
        open.frame(1),
        Err(Error::FrameShape {
            expected: (4, 5),
            actual: (1, 12)
        })
    ));
    let results: Vec<_> = open.frames(IterationMode::ReadAhead, 0..2).collect();
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}

#[test]
fn test_dataset_ids_are_unique() {
    let (_, a) = memory_dataset(1);
    let (_, b) = memory_dataset(1);
    assert_ne!(a.id(), b.id());
    assert_eq!(a.clone().id(), a.id());
}

#[test]
fn test_frame_new_rejects_wrong_length() {
    assert!(Frame::new(0, 2, 2, vec![1, 2, 3]).is_err());
    let frame = Frame::new(0, 2, 2, vec![1, 2, 3, 4]).expect("valid");
    assert_eq!(frame.total(), 10);
    assert_eq!(frame.to_f64(), vec![1.0, 2.0, 3.0, 4.0]);
}
