//! Domain-decomposition behavior: halo exchange in a 2x2 process grid and
//! agreement between serial and decomposed runs.

use std::io::Write;
use std::thread;

use flowsim::comm::Communicator;
use flowsim::compute::Compute;
use flowsim::geometry::Geometry;
use flowsim::grid::Grid;
use flowsim::parameter::Parameter;
use flowsim::solver::Solver;
use flowsim::Real;

fn scenario_32x32() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "size 32 32").unwrap();
    writeln!(file, "length 1.0 1.0").unwrap();
    file
}

#[test]
fn halo_exchange_in_a_2x2_grid() {
    let file = scenario_32x32();
    let path = file.path();
    let comms = Communicator::split(4).unwrap();

    thread::scope(|s| {
        for comm in comms {
            s.spawn(move || {
                let mut geom = Geometry::new();
                geom.load(path).unwrap();
                geom.recalculate(&comm).unwrap();
                let size = geom.size();
                assert_eq!((size.x, size.y), (18, 18));

                let rank = comm.rank();
                let mut grid = Grid::new(&geom);
                grid.initialize(rank as Real);
                comm.exchange_boundary(&mut grid).unwrap();

                // Ghost layers toward a neighbor carry that neighbor's
                // value; layers on a global edge keep their own.
                for y in 1..size.y - 1 {
                    let left = grid.cell_at(y * size.x);
                    let right = grid.cell_at(y * size.x + size.x - 1);
                    if comm.is_left() {
                        assert_eq!(left, rank as Real);
                    } else {
                        assert_eq!(left, (rank - 1) as Real, "rank {} left ghost", rank);
                    }
                    if comm.is_right() {
                        assert_eq!(right, rank as Real);
                    } else {
                        assert_eq!(right, (rank + 1) as Real, "rank {} right ghost", rank);
                    }
                }
                for x in 1..size.x - 1 {
                    let bottom = grid.cell_at(x);
                    let top = grid.cell_at((size.y - 1) * size.x + x);
                    if comm.is_bottom() {
                        assert_eq!(bottom, rank as Real);
                    } else {
                        assert_eq!(bottom, (rank - 2) as Real, "rank {} bottom ghost", rank);
                    }
                    if comm.is_top() {
                        assert_eq!(top, rank as Real);
                    } else {
                        assert_eq!(top, (rank + 2) as Real, "rank {} top ghost", rank);
                    }
                }
            });
        }
    });
}

#[test]
fn boundary_round_trip_reproduces_the_inner_column() {
    let file = scenario_32x32();
    let path = file.path();
    let comms = Communicator::split(2).unwrap();

    thread::scope(|s| {
        for comm in comms {
            s.spawn(move || {
                let mut geom = Geometry::new();
                geom.load(path).unwrap();
                geom.recalculate(&comm).unwrap();
                let size = geom.size();

                let mut grid = Grid::new(&geom);
                for y in 0..size.y {
                    for x in 0..size.x {
                        *grid.cell_at_mut(y * size.x + x) =
                            (comm.rank() as Real) * 1000.0 + (y * size.x + x) as Real;
                    }
                }
                let expected: Vec<Real> = if comm.rank() == 0 {
                    // Rank 0's right ghost will mirror rank 1's first
                    // interior column.
                    (0..size.y)
                        .map(|y| 1000.0 + (y * size.x + 1) as Real)
                        .collect()
                } else {
                    Vec::new()
                };

                comm.exchange_boundary(&mut grid).unwrap();

                if comm.rank() == 0 {
                    let ghost = grid.get_right_boundary(false);
                    assert_eq!(ghost, expected);
                }
            });
        }
    });
}

#[test]
fn serial_and_decomposed_runs_agree() {
    // Ten cavity steps on one rank.
    let file = scenario_32x32();
    let path = file.path();

    let serial_probe = {
        let comm = Communicator::single();
        let mut geom = Geometry::new();
        geom.load(path).unwrap();
        geom.recalculate(&comm).unwrap();
        let param = Parameter::new();
        let solver = Solver::red_black(&geom, param.omega);
        let mut comp = Compute::new(&geom, &comm, solver, None);
        for _ in 0..10 {
            comp.time_step(&geom, &param, &comm).unwrap();
        }
        // Global cell (5, 28), close to the lid.
        comp.u().cell_at(28 * geom.size().x + 5)
    };

    // The same steps across two ranks; rank 0 owns the probe.
    let comms = Communicator::split(2).unwrap();
    let probes: Vec<Option<Real>> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                s.spawn(move || {
                    let mut geom = Geometry::new();
                    geom.load(path).unwrap();
                    geom.recalculate(&comm).unwrap();
                    let param = Parameter::new();
                    let solver = Solver::red_black(&geom, param.omega);
                    let mut comp = Compute::new(&geom, &comm, solver, None);
                    for _ in 0..10 {
                        comp.time_step(&geom, &param, &comm).unwrap();
                    }
                    comm.is_master()
                        .then(|| comp.u().cell_at(28 * geom.size().x + 5))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let decomposed_probe = probes[0].unwrap();
    assert!(
        (serial_probe - decomposed_probe).abs() < 5e-3,
        "serial {} vs decomposed {}",
        serial_probe,
        decomposed_probe
    );
}
