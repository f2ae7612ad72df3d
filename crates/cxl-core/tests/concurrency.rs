//! Binds, unbinds, and removals racing on a shared topology.

#![allow(clippy::pedantic, clippy::nursery, clippy::cast_possible_truncation)]

mod common;

use std::thread;

use bitflags as _;
use common::{fabric, fabric_with, fast_config, WINDOW_SIZE};
use cxl_core::{
    bind_region, delete_region, remove_root_decoder, unbind_region, CxlError, REGION_ALIGN,
};
use parking_lot as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;
use uuid as _;

#[test]
fn competing_binds_for_one_endpoint_decoder_have_one_winner() {
    for _ in 0..16 {
        let fab = fabric(&[&[1]], 256);
        let regions = [
            fab.region(256, &[0], REGION_ALIGN),
            fab.region(256, &[0], REGION_ALIGN),
        ];

        let results: Vec<_> = thread::scope(|scope| {
            let workers: Vec<_> = regions
                .iter()
                .map(|region| {
                    let topo = &fab.topo;
                    let handle = region.handle();
                    scope.spawn(move || bind_region(topo, handle))
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().expect("worker panicked"))
                .collect()
        });

        let winners = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(winners, 1, "{results:?}");
        let loser = results
            .iter()
            .find_map(|result| result.as_ref().err())
            .expect("one loser");
        assert!(matches!(loser, CxlError::NoFreeDecoder { .. }));
        assert_eq!(fab.window_available(), WINDOW_SIZE - REGION_ALIGN);
        assert_eq!(fab.claimed_decoders(), 2);
        assert_eq!(fab.enabled_decoders(), 2);
    }
}

#[test]
fn parallel_binds_on_distinct_endpoints_get_disjoint_ranges() {
    let fab = fabric_with(&[&[4]], 256, fast_config(), 4, 1);
    let regions: Vec<_> = (0..4)
        .map(|endpoint| fab.region(256, &[endpoint], REGION_ALIGN))
        .collect();

    thread::scope(|scope| {
        for region in &regions {
            let topo = &fab.topo;
            let handle = region.handle();
            scope.spawn(move || bind_region(topo, handle).expect("bind"));
        }
    });

    let mut ranges: Vec<_> = regions
        .iter()
        .map(|region| region.config().res.expect("bound range"))
        .collect();
    ranges.sort_by_key(|range| range.start);
    for pair in ranges.windows(2) {
        assert!(pair[0].start + pair[0].size <= pair[1].start, "{pair:?}");
    }
    assert_eq!(fab.window_available(), WINDOW_SIZE - 4 * REGION_ALIGN);
    assert_eq!(fab.enabled_decoders(), 8);
}

#[test]
fn bind_and_unbind_of_one_region_stay_consistent() {
    let fab = fabric(&[&[1, 1]], 256);
    let region = fab.region(256, &[0, 1], 2 * REGION_ALIGN);

    thread::scope(|scope| {
        for _ in 0..2 {
            let topo = &fab.topo;
            let handle = region.handle();
            scope.spawn(move || {
                for _ in 0..25 {
                    bind_region(topo, handle).expect("bind");
                    unbind_region(topo, handle).expect("unbind");
                }
            });
        }
    });

    let state = region.lock();
    assert!(!state.active);
    assert_eq!(state.res, None);
    assert!(state.committed.is_empty());
    drop(state);
    assert_eq!(fab.claimed_decoders(), 0);
    assert_eq!(fab.enabled_decoders(), 0);
    assert_eq!(fab.window_available(), WINDOW_SIZE);
}

#[test]
fn region_delete_racing_root_teardown_removes_everything_once() {
    for _ in 0..16 {
        let fab = fabric(&[&[1, 1, 1]], 256);
        let regions: Vec<_> = (0..3)
            .map(|endpoint| fab.region(256, &[endpoint], REGION_ALIGN))
            .collect();
        for region in &regions[..2] {
            bind_region(&fab.topo, region.handle()).expect("bind");
        }
        let names: Vec<String> = regions
            .iter()
            .map(|region| region.name().to_owned())
            .collect();

        let (deletes, teardown) = thread::scope(|scope| {
            let deleter = scope.spawn(|| {
                names
                    .iter()
                    .map(|name| delete_region(&fab.topo, fab.root_decoder, name))
                    .collect::<Vec<_>>()
            });
            let remover = scope.spawn(|| remove_root_decoder(&fab.topo, fab.root_decoder));
            (
                deleter.join().expect("deleter panicked"),
                remover.join().expect("remover panicked"),
            )
        });

        assert_eq!(teardown, Ok(()));
        for result in deletes {
            assert!(
                matches!(
                    result,
                    Ok(())
                        | Err(CxlError::NotFound { .. }
                            | CxlError::RegionDead { .. }
                            | CxlError::UnknownHandle { .. })
                ),
                "{result:?}"
            );
        }
        assert!(fab.topo.regions().is_empty());
        assert!(regions.iter().all(|region| region.lock().dead));
        assert_eq!(fab.enabled_decoders(), 0);
        assert_eq!(fab.claimed_decoders(), 0);
        assert_eq!(fab.window_available(), WINDOW_SIZE);
    }
}
