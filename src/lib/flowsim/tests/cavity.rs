//! Driven-cavity behavior on the default setup: Re = 1000, 8x8 interior,
//! lid velocity (1, 0).

use flowsim::comm::Communicator;
use flowsim::compute::Compute;
use flowsim::geometry::Geometry;
use flowsim::parameter::Parameter;
use flowsim::solver::Solver;
use flowsim::Real;

#[test]
fn lid_drives_a_vortex_with_decreasing_profile() {
    let geom = Geometry::new();
    let param = Parameter::new();
    let comm = Communicator::single();
    let solver = Solver::red_black(&geom, param.omega);
    let mut comp = Compute::new(&geom, &comm, solver, None);

    while comp.time() < param.tend {
        comp.time_step(&geom, &param, &comm).unwrap();
    }

    let size = geom.size();
    let u = comp.u();
    let at = |x: u32, y: u32| u.cell_at(y * size.x + x);

    // The cell row under the lid drags along with it.
    assert!(at(4, 7) > 0.0, "u(4,7) = {}", at(4, 7));

    // The profile falls off monotonically with depth through the upper
    // part of the primary vortex, and the lower half lags far behind the
    // lid.
    assert!(at(4, 6) < at(4, 7), "u(4,6) = {}, u(4,7) = {}", at(4, 6), at(4, 7));
    assert!(at(4, 5) < at(4, 6), "u(4,5) = {}, u(4,6) = {}", at(4, 5), at(4, 6));
    assert!(at(4, 2) < at(4, 7), "u(4,2) = {}, u(4,7) = {}", at(4, 2), at(4, 7));

    // The discrete Dirichlet value at every lid midpoint is the lid
    // velocity, to machine precision.
    for x in 1..size.x - 1 {
        let midpoint = 0.5 * (at(x, size.y - 1) + at(x, size.y - 2));
        assert!((midpoint - 1.0).abs() < 1e-12, "lid midpoint at x={}: {}", x, midpoint);
    }

    // Away from the lid no cell can exceed the lid speed.
    let mut interior_max: Real = 0.0;
    for y in 1..size.y - 1 {
        for x in 1..size.x - 1 {
            interior_max = interior_max.max(at(x, y).abs());
        }
    }
    assert!(interior_max <= 1.05, "interior |u| peaked at {}", interior_max);
}

#[test]
fn every_step_converges_and_stays_finite() {
    let geom = Geometry::new();
    let param = Parameter::new();
    let comm = Communicator::single();
    let solver = Solver::red_black(&geom, param.omega);
    let mut comp = Compute::new(&geom, &comm, solver, None);

    for _ in 0..50 {
        let report = comp.time_step(&geom, &param, &comm).unwrap();
        assert!(report.dt > 0.0 && report.dt <= param.dt);
        assert!(report.residual.is_finite());
        assert!(comp.u().abs_max().is_finite());
        assert!(comp.v().abs_max().is_finite());
    }
}
