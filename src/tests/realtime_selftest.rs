use std::collections::BTreeSet;
use std::time::Duration;

use nalgebra::DMatrix;

use crate::config::IcaConfig;
use crate::operation::Decomposition;
use crate::registry::{InputChannel, StreamRegistry};

fn config() -> IcaConfig {
    IcaConfig {
        training_duration_secs: 1.0,
        target_sample_rate: 100.0,
        ..IcaConfig::default()
    }
}

fn layout(count: usize) -> Vec<InputChannel> {
    (0..count)
        .map(|i| InputChannel {
            global_index: i,
            stream_id: 1,
            stream_name: "EEG".into(),
            name: format!("CH{}", i + 1),
            sample_rate: 100.0,
        })
        .collect()
}

fn diagonal(n: usize, value: f32) -> DMatrix<f32> {
    DMatrix::from_fn(n, n, |i, j| if i == j { value } else { 0.0 })
}

#[test]
fn held_cache_lock_skips_caching_but_still_applies() {
    let registry = StreamRegistry::new();
    registry.update_streams(&layout(2), &config());
    let state = registry.get(1).unwrap();
    state.operation().replace(
        Decomposition::new(
            diagonal(2, 0.5),
            diagonal(2, 2.0),
            vec![0, 1],
            BTreeSet::from([0, 1]),
        )
        .unwrap(),
    );

    let handle = state.cache().lock();
    let mut block = vec![vec![1.0f32; 10], vec![-1.0f32; 10]];
    registry.process_block(&mut block);
    assert_eq!(handle.written(), 0);
    drop(handle);

    // Every component rejected: both channels are silenced.
    assert!(block.iter().flatten().all(|&s| s == 0.0));

    let mut block = vec![vec![1.0f32; 10], vec![-1.0f32; 10]];
    registry.process_block(&mut block);
    assert_eq!(state.cache().lock().written(), 10);
}

#[test]
fn realtime_thread_never_waits_for_a_cache_holder() {
    let registry = StreamRegistry::new();
    registry.update_streams(&layout(3), &config());
    let state = registry.get(1).unwrap();

    let (done_tx, done_rx) = crossbeam_channel::bounded::<usize>(1);
    let handle = state.cache().lock();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let mut blocks = 0;
            for _ in 0..500 {
                let mut block = vec![vec![0.25f32; 32]; 3];
                registry.process_block(&mut block);
                blocks += 1;
            }
            let _ = done_tx.send(blocks);
        });
        // The holder keeps the lock until the real-time loop reports back, so
        // a blocking acquisition would deadlock and time out here.
        let blocks = done_rx.recv_timeout(Duration::from_secs(10));
        assert_eq!(blocks.ok(), Some(500));
        assert_eq!(handle.written(), 0);
    });
    drop(handle);
}

#[test]
fn pinned_snapshot_blocks_resets_but_not_the_realtime_path() {
    let registry = StreamRegistry::new();
    registry.update_streams(&layout(2), &config());
    let state = registry.get(1).unwrap();

    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
    let pinned = state.operation().try_read();
    assert!(pinned.is_some());
    assert!(!state.operation().try_reset());
    std::thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..100 {
                let mut block = vec![vec![0.5f32; 16]; 2];
                registry.process_block(&mut block);
            }
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok());
    });
    drop(pinned);
    assert!(state.operation().try_reset());
    // 1600 samples through a 100-slot cache.
    assert_eq!(state.cache().lock().written(), 100);
}

#[test]
fn held_decomposition_write_lock_passes_blocks_through() {
    let registry = StreamRegistry::new();
    registry.update_streams(&layout(2), &config());
    let state = registry.get(1).unwrap();
    state.operation().replace(
        Decomposition::new(
            diagonal(2, 1.0),
            diagonal(2, 1.0),
            vec![0, 1],
            BTreeSet::from([0]),
        )
        .unwrap(),
    );

    let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let (done_tx, done_rx) = crossbeam_channel::bounded::<bool>(1);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            // The edit closure runs with the write side held.
            let edited = state.operation().edit(|op| {
                let _ = entered_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
                op.set_rejected(BTreeSet::from([1]))
            });
            assert!(edited.is_ok());
        });
        assert!(entered_rx.recv_timeout(Duration::from_secs(10)).is_ok());

        scope.spawn(|| {
            let mut untouched = true;
            for _ in 0..100 {
                let mut block = vec![vec![1.0f32; 8], vec![2.0f32; 8]];
                registry.process_block(&mut block);
                untouched &= block[0] == vec![1.0; 8] && block[1] == vec![2.0; 8];
            }
            let _ = done_tx.send(untouched);
        });
        let finished = done_rx.recv_timeout(Duration::from_secs(10));
        let _ = release_tx.send(());
        assert_eq!(finished.ok(), Some(true));
    });

    assert_eq!(state.cache().lock().written(), 100);
    assert_eq!(state.operation().snapshot().rejected_components(), &BTreeSet::from([1]));
    let mut block = vec![vec![1.0f32; 8], vec![2.0f32; 8]];
    registry.process_block(&mut block);
    assert_eq!(block[0], vec![1.0; 8]);
    assert_eq!(block[1], vec![0.0; 8]);
}
