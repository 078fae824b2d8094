//! Sub-grid fetches and neighbor loads.

mod common;

use common::{fill_with_index, global_index, run_ranks};
use halocline::device::Stream;
use halocline::{ElementType, GridShape, HaloError, IndexArray};

fn box_points(offset: IndexArray, size: IndexArray) -> Vec<IndexArray> {
    let mut out = Vec::new();
    for i2 in 0..size[2] {
        for i1 in 0..size[1] {
            for i0 in 0..size[0] {
                out.push(offset + IndexArray::new(i0, i1, i2));
            }
        }
    }
    out
}

#[test]
fn own_partition_needs_no_fetch() {
    let size = IndexArray::new(8, 1, 1);
    let results = run_ranks("2", 1, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Float, 1, size)).unwrap();
        fill_with_index(gs.grid_mut(id).unwrap());
        let lo = gs.grid(id).unwrap().local_offset();
        let fetched = gs.load_subgrid(id, lo + IndexArray::new(1, 0, 0), IndexArray::new(2, 1, 1)).unwrap();
        let none = fetched.is_none();
        (none, gs.grid(id).unwrap().remote_grid_active())
    });
    assert_eq!(results, vec![(true, false), (true, false)]);
}

#[test]
fn box_across_four_partitions() {
    let size = IndexArray::new(8, 6, 1);
    let offset = IndexArray::new(2, 1, 0);
    let extent = IndexArray::new(4, 4, 1);
    run_ranks("2x2", 2, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Float, 2, size)).unwrap();
        fill_with_index(gs.grid_mut(id).unwrap());

        let remote = gs.load_subgrid(id, offset, extent).unwrap().unwrap();
        assert_eq!(remote.local_offset(), offset);
        assert_eq!(remote.local_size(), extent);
        for p in box_points(offset, extent) {
            assert_eq!(remote.read_element::<f32>(&p).unwrap(), global_index(&p, &size) as f32, "at {p}");
        }

        let grid = gs.grid(id).unwrap();
        assert!(grid.remote_grid_active());
        assert!(matches!(
            grid.read_element::<f32>(&grid.local_offset()),
            Err(HaloError::RemoteGridActive(_))
        ));
    });
}

#[test]
fn one_rank_owns_the_box() {
    let size = IndexArray::new(8, 6, 1);
    let results = run_ranks("2x2", 2, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Int, 2, size)).unwrap();
        let values: Vec<i32> = (0..12).map(|v| v + 100 * gs.rank() as i32).collect();
        gs.grid_mut(id).unwrap().copyin_local_typed(&values).unwrap();

        let offset = IndexArray::new(1, 1, 0);
        let extent = IndexArray::new(2, 2, 1);
        gs.load_subgrid(id, offset, extent)
            .unwrap()
            .map(|remote| remote.read_element::<i32>(&IndexArray::new(2, 2, 0)).unwrap())
    });
    // Rank 0 holds the box itself; (2, 2) is element 2 + 2 * 4 of its block.
    assert_eq!(results, vec![None, Some(10), Some(10), Some(10)]);
}

#[test]
fn box_is_clipped_to_the_grid() {
    let size = IndexArray::new(6, 1, 1);
    let results = run_ranks("3", 1, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Float, 1, size)).unwrap();
        fill_with_index(gs.grid_mut(id).unwrap());
        let remote = gs
            .load_subgrid(id, IndexArray::new(-2, 0, 0), IndexArray::new(5, 1, 1))
            .unwrap();
        remote.map(|g| (g.local_offset()[0], g.local_size()[0], g.copyout_local_typed::<f32>().unwrap()))
    });
    let expected = Some((0, 3, vec![0.0, 1.0, 2.0]));
    assert_eq!(results, vec![expected.clone(), expected.clone(), expected]);
}

#[test]
fn neighbor_load_reuses_halos() {
    let size = IndexArray::new(8, 1, 1);
    let lo_off = IndexArray::new(-1, 0, 0);
    let hi_off = IndexArray::new(1, 0, 0);
    let results = run_ranks("2", 1, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Float, 1, size)).unwrap();
        fill_with_index(gs.grid_mut(id).unwrap());
        assert!(gs
            .load_neighbor(id, &lo_off, &hi_off, false, false, false, Stream::DEFAULT)
            .unwrap()
            .is_none());

        // Rank 0 looks at 4, rank 1 at 3.
        let point = IndexArray::new(if gs.rank() == 0 { 4 } else { 3 }, 0, 0);
        let first = gs.grid(id).unwrap().read_element::<f32>(&point).unwrap();

        let grid = gs.grid_mut(id).unwrap();
        let bumped: Vec<f32> = grid.copyout_local_typed::<f32>().unwrap().iter().map(|v| v + 100.0).collect();
        grid.copyin_local_typed(&bumped).unwrap();

        gs.load_neighbor(id, &lo_off, &hi_off, false, true, false, Stream::DEFAULT).unwrap();
        let reused = gs.grid(id).unwrap().read_element::<f32>(&point).unwrap();
        gs.load_neighbor(id, &lo_off, &hi_off, false, false, false, Stream::DEFAULT).unwrap();
        let refreshed = gs.grid(id).unwrap().read_element::<f32>(&point).unwrap();
        (first, reused, refreshed)
    });
    assert_eq!(results, vec![(4.0, 4.0, 104.0), (3.0, 3.0, 103.0)]);
}

#[test]
fn wider_reuse_request_exchanges_again() {
    let size = IndexArray::new(8, 1, 1);
    let results = run_ranks("2", 1, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Float, 1, size)).unwrap();
        fill_with_index(gs.grid_mut(id).unwrap());
        let zero = IndexArray::default();
        gs.load_neighbor(id, &zero, &IndexArray::new(1, 0, 0), false, false, false, Stream::DEFAULT)
            .unwrap();
        gs.load_neighbor(id, &IndexArray::new(-2, 0, 0), &IndexArray::new(1, 0, 0), false, true, false, Stream::DEFAULT)
            .unwrap();
        let g = gs.grid(id).unwrap();
        (g.halo_bw_width()[0], g.halo_fw_width()[0])
    });
    assert_eq!(results, vec![(0, 1), (2, 0)]);
}

#[test]
fn wide_neighborhood_falls_back_to_fetch() {
    let size = IndexArray::new(8, 1, 1);
    let results = run_ranks("4", 1, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Float, 1, size)).unwrap();
        fill_with_index(gs.grid_mut(id).unwrap());
        let stream = gs.device().create_stream();
        let box_range = gs
            .load_neighbor(id, &IndexArray::new(-3, 0, 0), &IndexArray::new(1, 0, 0), false, false, false, stream)
            .unwrap()
            .map(|remote| {
                let lo = remote.local_offset()[0];
                let values = remote.copyout_local_typed::<f32>().unwrap();
                (lo, values)
            });
        assert!(gs.grid(id).unwrap().remote_grid_active());

        // A narrow load goes back to the halos.
        gs.load_neighbor(id, &IndexArray::new(-1, 0, 0), &IndexArray::default(), false, false, false, stream)
            .unwrap();
        assert!(!gs.grid(id).unwrap().remote_grid_active());
        box_range
    });
    let expect = |lo: i64, hi: i64| Some((lo, (lo..hi).map(|v| v as f32).collect::<Vec<_>>()));
    assert_eq!(results, vec![expect(0, 3), expect(0, 5), expect(1, 7), expect(3, 8)]);
}

#[test]
fn periodic_neighbor_load_wraps() {
    let size = IndexArray::new(6, 4, 1);
    run_ranks("3x1", 2, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Float, 2, size)).unwrap();
        fill_with_index(gs.grid_mut(id).unwrap());
        gs.load_neighbor(id, &IndexArray::new(-1, -1, 0), &IndexArray::new(1, 1, 0), true, false, true, Stream::DEFAULT)
            .unwrap();
        let g = gs.grid(id).unwrap();
        let lo = g.local_offset();
        let corner = IndexArray::new(lo[0] - 1, -1, 0);
        let wrapped = IndexArray::new(corner[0].rem_euclid(6), 3, 0);
        assert_eq!(g.read_element::<f32>(&corner).unwrap(), global_index(&wrapped, &size) as f32);
    });
}

#[test]
fn periodic_load_too_wide_for_halos_fails() {
    // Partitions of 2 cannot supply a backward halo of 3, and a clipped
    // fetch would lose the wraparound.
    let size = IndexArray::new(8, 1, 1);
    let results = run_ranks("4", 1, size, move |mut gs| {
        let id = gs.create_grid(&GridShape::new(ElementType::Float, 1, size)).unwrap();
        fill_with_index(gs.grid_mut(id).unwrap());
        let err = gs
            .load_neighbor(id, &IndexArray::new(-3, 0, 0), &IndexArray::new(1, 0, 0), false, false, true, Stream::DEFAULT)
            .unwrap_err();
        let active = gs.grid(id).unwrap().remote_grid_active();
        (matches!(err, HaloError::HaloTooWide { dim: 0, width: 3, .. }), active)
    });
    assert_eq!(results, vec![(true, false); 4]);
}
