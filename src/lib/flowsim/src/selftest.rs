//! Interactive subsystem checks behind the `TEST_*` command-line modes.
//!
//! These print what a subsystem computes next to the expected value so a
//! broken build can be narrowed down from the shell, without the test
//! harness. They are diagnostics, not assertions: the process exits 0
//! unless the subsystem itself fails.

use crate::comm::Communicator;
use crate::compute::Compute;
use crate::geometry::Geometry;
use crate::grid::Grid;
use crate::iterator::{BoundaryIterator, Edge, GridIter};
use crate::parameter::Parameter;
use crate::solver::Solver;
use crate::{MultiReal, Real, SimError};

/// Runs the named check. `param` and `geom` are the instances the driver
/// already loaded, so `TEST_LOAD` can echo exactly what a scenario file
/// produced.
pub fn run(case: &str, param: &Parameter, geom: &Geometry) -> Result<(), SimError> {
    match case {
        "TEST_COMPUTE" => compute_check(geom, param),
        "TEST_ITERATOR" => {
            iterator_check(geom);
            Ok(())
        }
        "TEST_GEOMETRY" => {
            geometry_check();
            Ok(())
        }
        "TEST_PARAMETER" => {
            parameter_check(param);
            Ok(())
        }
        "TEST_GRID" => {
            grid_check(geom);
            Ok(())
        }
        "TEST_INTERPOLATE" => {
            interpolate_check(geom);
            Ok(())
        }
        "TEST_LOAD" => {
            load_check(param, geom);
            Ok(())
        }
        "TEST_SOLVER" => solver_check(geom),
        other => Err(SimError::InvalidConfig(format!(
            "unknown test mode: {}",
            other
        ))),
    }
}

fn compute_check(geom: &Geometry, param: &Parameter) -> Result<(), SimError> {
    println!("Testing Compute");
    let comm = Communicator::single();
    let solver = Solver::red_black(geom, param.omega);
    let mut comp = Compute::new(geom, &comm, solver, None);
    for step in 0..5 {
        let report = comp.time_step(geom, param, &comm)?;
        println!(
            "step {}: t={:.4} dt={:.4} iterations={} residual={:.3e}",
            step,
            comp.time(),
            report.dt,
            report.iterations,
            report.residual
        );
    }
    println!("max |u| = {:.4}", comp.u().abs_max());
    Ok(())
}

fn iterator_check(geom: &Geometry) {
    println!("Testing Iterator");

    let mut it = geom.iter();
    let mut visited = 0;
    while it.valid() {
        visited += 1;
        it.next();
    }
    println!(
        "full run: {} cells ({} expected)",
        visited,
        geom.size().x * geom.size().y
    );

    let mut init = geom.interior();
    visited = 0;
    while init.valid() {
        visited += 1;
        init.next();
    }
    println!(
        "interior run: {} cells ({} expected)",
        visited,
        (geom.size().x - 2) * (geom.size().y - 2)
    );

    for edge in Edge::ALL {
        let mut boit = geom.boundary(edge);
        let first = boit.pos();
        let mut last = first;
        while boit.valid() {
            last = boit.pos();
            boit.next();
        }
        println!(
            "{:?} edge: ({}, {}) .. ({}, {})",
            edge, first.x, first.y, last.x, last.y
        );
    }

    let corner = BoundaryIterator::corner_top_right(geom.size());
    println!(
        "top-right corner {} -> left {}, down {}",
        corner.value(),
        corner.left().value(),
        corner.down().value()
    );
}

fn geometry_check() {
    let geom = Geometry::new();
    let comm = Communicator::single();
    println!("Testing Geometry");
    println!("size {} {}", geom.size().x, geom.size().y);
    println!("length {} {}", geom.length().x, geom.length().y);
    println!("mesh {} {}", geom.mesh().x, geom.mesh().y);

    let mut field = Grid::new(&geom);
    geom.apply_boundary_u(&comm, &mut field);
    println!("u after boundary update:\n{}", field.dump());

    field.initialize(0.0);
    geom.apply_boundary_v(&comm, &mut field);
    println!("v after boundary update:\n{}", field.dump());

    field.initialize(0.0);
    geom.apply_boundary_p(&comm, &mut field);
    println!("p after boundary update:\n{}", field.dump());
}

fn parameter_check(param: &Parameter) {
    println!("Testing Parameter");
    println!("re {} (1000 by default)", param.re);
    println!("itermax {} (100 by default)", param.itermax);
    println!("omega {}", param.omega);
    println!("tau {}", param.tau);
}

fn grid_check(geom: &Geometry) {
    println!("Testing Grid");
    let mut grid = Grid::new(geom);
    let size = geom.size();
    // A linear ramp: first derivatives constant, second derivatives zero.
    for y in 0..size.y {
        for x in 0..size.x {
            *grid.cell_at_mut(y * size.x + x) = (x + y) as Real;
        }
    }
    let center = crate::iterator::CellIterator::at(2 * size.x + 2, size);
    println!(
        "dx_l {} dx_r {} ({} expected)",
        grid.dx_l(&center),
        grid.dx_r(&center),
        geom.inv_mesh().x
    );
    println!(
        "dxx {} dyy {} (0 expected)",
        grid.dxx(&center),
        grid.dyy(&center)
    );
    println!("max {} min {} absmax {}", grid.max(), grid.min(), grid.abs_max());

    let mut shape = Grid::new(geom);
    shape.init_square(
        MultiReal::new(0.25, 0.25),
        MultiReal::new(0.75, 0.75),
        1.0,
    );
    shape.init_circle(MultiReal::new(0.5, 0.5), 0.2, 2.0);
    println!("shaped field:\n{}", shape.dump());
}

fn interpolate_check(geom: &Geometry) {
    println!("Testing Interpolate");
    let mut grid = Grid::new(geom);
    let size = geom.size();
    for y in 0..size.y {
        for x in 0..size.x {
            *grid.cell_at_mut(y * size.x + x) = (x + y) as Real;
        }
    }
    let h = geom.mesh();
    println!(
        "interpolate(h/2, h/2) = {} (1.0 expected)",
        grid.interpolate(MultiReal::new(0.5 * h.x, 0.5 * h.y))
    );
    println!(
        "interpolate(1.5h, 2.5h) = {} (4.0 expected)",
        grid.interpolate(MultiReal::new(1.5 * h.x, 2.5 * h.y))
    );
}

fn load_check(param: &Parameter, geom: &Geometry) {
    println!("re: {}", param.re);
    println!("omega: {}", param.omega);
    println!("alpha: {}", param.alpha);
    println!("dt: {}", param.dt);
    println!("tend: {}", param.tend);
    println!("itermax: {}", param.itermax);
    println!("eps: {}", param.eps);
    println!("tau: {}", param.tau);
    println!("size: ({}, {})", geom.size().x, geom.size().y);
    println!("length: ({}, {})", geom.length().x, geom.length().y);
    println!("mesh: ({}, {})", geom.mesh().x, geom.mesh().y);
}

fn solver_check(geom: &Geometry) -> Result<(), SimError> {
    println!("Testing Solver");
    let comm = Communicator::single();
    let mut p = Grid::new(geom);
    let rhs = Grid::new(geom);

    // A paraboloid bump as the initial guess.
    let size = geom.size();
    let mut it = geom.interior();
    while it.valid() {
        let pos = it.pos();
        let bump = -((pos.x as Real - 0.25 * size.x as Real)
            * (pos.x as Real - 0.75 * size.x as Real))
            - ((pos.y as Real - 0.25 * size.y as Real) * (pos.y as Real - 0.75 * size.y as Real));
        *p.cell_mut(&it) = bump.max(0.0);
        it.next();
    }

    let solver = Solver::red_black(geom, 1.7);
    for iter in 0..10 {
        let res = solver.iterate(&comm, geom, &mut p, &rhs)?;
        println!(
            "iter {}: res {:.4e}, max {:.4}, min {:.4}",
            iter,
            res,
            p.max(),
            p.min()
        );
        geom.apply_boundary_p(&comm, &mut p);
    }
    Ok(())
}
