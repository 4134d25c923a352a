//! The time-step driver.
//!
//! One call to [`Compute::time_step`] runs the full pipeline: adaptive
//! time-step selection with a global minimum, the momentum prediction
//! (F, G), the pressure-Poisson iteration with interleaved halo
//! exchanges, the velocity correction, boundary enforcement, optional
//! substance transport, and particle tracing. The step reports its
//! residual and iteration count; hitting the iteration cap is a warning,
//! a diverging field is an error every rank agrees on.

use tracing::warn;

use crate::comm::Communicator;
use crate::geometry::{CellType, Geometry};
use crate::grid::Grid;
use crate::iterator::GridIter;
use crate::parameter::Parameter;
use crate::solver::Solver;
use crate::substance::Substance;
use crate::{Index, MultiReal, Real, SimError};

/// Any field magnitude beyond this ends the run as a numeric failure.
const OVERFLOW_LIMIT: Real = 1e10;

/// Outcome of one time step.
#[derive(Clone, Copy, Debug)]
pub struct StepReport {
    /// The step actually taken.
    pub dt: Real,
    /// True when the step landed on a fixed-output instant.
    pub print: bool,
    /// Pressure iterations used.
    pub iterations: Index,
    /// Final global residual of the pressure iteration.
    pub residual: Real,
    /// False when the iteration cap was reached before the residual
    /// target.
    pub converged: bool,
}

pub struct Compute {
    t: Real,
    u: Grid,
    v: Grid,
    p: Grid,
    /// Preliminary velocities of the momentum prediction.
    f: Grid,
    g: Grid,
    rhs: Grid,
    /// Scratch for the derived visualization fields.
    tmp: Grid,
    stream: Grid,
    vort: Grid,
    solver: Solver,
    substance: Option<Substance>,
    /// Seed per streakline; a new head is emitted there every step.
    streak_seeds: Vec<MultiReal>,
    streaklines: Vec<Vec<MultiReal>>,
    traces: Vec<Vec<MultiReal>>,
}

impl Compute {
    /// Builds all fields against the geometry and applies the initial
    /// boundary values.
    pub fn new(
        geom: &Geometry,
        comm: &Communicator,
        solver: Solver,
        substance: Option<Substance>,
    ) -> Self {
        let h = geom.mesh();
        let off_u = MultiReal::new(h.x, h.y / 2.0);
        let off_v = MultiReal::new(h.x / 2.0, h.y);
        let off_p = MultiReal::new(h.x / 2.0, h.y / 2.0);
        let off_corner = MultiReal::new(h.x, h.y);

        let mut comp = Compute {
            t: 0.0,
            u: Grid::with_offset(geom, off_u),
            v: Grid::with_offset(geom, off_v),
            p: Grid::with_offset(geom, off_p),
            f: Grid::with_offset(geom, off_u),
            g: Grid::with_offset(geom, off_v),
            rhs: Grid::with_offset(geom, off_p),
            tmp: Grid::with_offset(geom, off_corner),
            stream: Grid::with_offset(geom, off_corner),
            vort: Grid::with_offset(geom, off_corner),
            solver,
            substance,
            streak_seeds: geom.streaklines().to_vec(),
            streaklines: geom.streaklines().iter().map(|s| vec![*s]).collect(),
            traces: geom.traces().iter().map(|s| vec![*s]).collect(),
        };
        geom.apply_boundary_u(comm, &mut comp.u);
        geom.apply_boundary_v(comm, &mut comp.v);
        geom.apply_boundary_p(comm, &mut comp.p);
        comp
    }

    /// Simulated time so far.
    pub fn time(&self) -> Real {
        self.t
    }

    pub fn u(&self) -> &Grid {
        &self.u
    }

    pub fn v(&self) -> &Grid {
        &self.v
    }

    pub fn p(&self) -> &Grid {
        &self.p
    }

    pub fn rhs(&self) -> &Grid {
        &self.rhs
    }

    pub fn substance(&self) -> Option<&Substance> {
        self.substance.as_ref()
    }

    pub fn streaklines(&self) -> &[Vec<MultiReal>] {
        &self.streaklines
    }

    pub fn traces(&self) -> &[Vec<MultiReal>] {
        &self.traces
    }

    /// Advances the simulation by one time step.
    pub fn time_step(
        &mut self,
        geom: &Geometry,
        param: &Parameter,
        comm: &Communicator,
    ) -> Result<StepReport, SimError> {
        let (dt, print) = self.select_dt(geom, param, comm)?;

        // Momentum prediction, with the boundary values of the velocities
        // imposed on F and G so the correction cannot move the walls.
        self.momentum_equation(dt, geom, param);
        geom.apply_boundary_u(comm, &mut self.f);
        geom.apply_boundary_v(comm, &mut self.g);
        comm.exchange_boundary(&mut self.f)?;
        comm.exchange_boundary(&mut self.g)?;

        self.compute_rhs(dt, geom);

        // Pressure iteration: smooth, agree on the residual, re-impose the
        // pressure boundary.
        let mut iterations: Index = 0;
        let mut residual = param.eps + 1.0;
        while iterations < param.itermax && residual >= param.eps {
            let local = self.solver.iterate(comm, geom, &mut self.p, &self.rhs)?;
            residual = comm.all_max(local)?;
            geom.apply_boundary_p(comm, &mut self.p);
            iterations += 1;
        }
        let converged = residual < param.eps;
        if !converged && comm.is_master() {
            warn!(
                residual,
                iterations, "pressure iteration stopped at the cap"
            );
        }

        self.new_velocities(dt, geom);
        comm.exchange_boundary(&mut self.u)?;
        comm.exchange_boundary(&mut self.v)?;
        geom.apply_boundary_u(comm, &mut self.u);
        geom.apply_boundary_v(comm, &mut self.v);

        if let Some(substance) = self.substance.as_mut() {
            substance.step(dt, &self.u, &self.v, geom, comm)?;
        }

        self.advance_particles(dt, print, geom, comm)?;
        self.check_overflow(comm)?;

        self.t += dt;
        Ok(StepReport {
            dt,
            print,
            iterations,
            residual,
            converged,
        })
    }

    /// Picks the time step: CFL limits in both directions, the diffusive
    /// stability limit, the configured cap, all scaled by tau, then the
    /// global minimum. A fixed-output instant inside the step shortens it
    /// to land exactly there.
    fn select_dt(
        &self,
        geom: &Geometry,
        param: &Parameter,
        comm: &Communicator,
    ) -> Result<(Real, bool), SimError> {
        let h = geom.mesh();
        let hx2 = h.x * h.x;
        let hy2 = h.y * h.y;

        let local = if param.tau > 0.0 {
            let mut limit = param.dt.min(param.re * hx2 * hy2 / (4.0 * (hx2 + hy2)));
            let umax = self.u.abs_max();
            if umax > 0.0 {
                limit = limit.min(h.x / umax);
            }
            let vmax = self.v.abs_max();
            if vmax > 0.0 {
                limit = limit.min(h.y / vmax);
            }
            param.tau * limit
        } else {
            param.dt
        };
        let mut dt = comm.all_min(local)?;

        let mut print = false;
        if param.fixed_dt > 0.0 {
            let inv = 1.0 / param.fixed_dt;
            if (self.t * inv).floor() < ((self.t + dt) * inv).floor() {
                let mut next = ((self.t * inv).floor() + 1.0) * param.fixed_dt;
                if next - self.t < 1e-12 {
                    // Rounding placed t a hair before the instant it
                    // already reached; aim for the one after.
                    next += param.fixed_dt;
                }
                if next - self.t <= dt + 1e-12 {
                    dt = next - self.t;
                    print = true;
                }
            }
        }

        if !dt.is_finite() || dt <= 0.0 {
            return Err(SimError::NumericFailure(format!(
                "time step collapsed to {}",
                dt
            )));
        }
        Ok((dt, print))
    }

    /// Fills F and G on the interior fluid cells; everywhere else they
    /// carry the current velocities.
    fn momentum_equation(&mut self, dt: Real, geom: &Geometry, param: &Parameter) {
        let inv_re = param.inv_re();
        let alpha = param.alpha;
        let mut it = geom.interior();
        while it.valid() {
            if geom.cell_type_at(&it) == CellType::Fluid {
                *self.f.cell_mut(&it) = self.u.cell(&it)
                    + dt * (inv_re * (self.u.dxx(&it) + self.u.dyy(&it))
                        - self.u.dc_udu_x(&it, alpha)
                        - self.u.dc_vdu_y(&it, alpha, &self.v));
                *self.g.cell_mut(&it) = self.v.cell(&it)
                    + dt * (inv_re * (self.v.dxx(&it) + self.v.dyy(&it))
                        - self.v.dc_udv_x(&it, alpha, &self.u)
                        - self.v.dc_vdv_y(&it, alpha));
            } else {
                *self.f.cell_mut(&it) = self.u.cell(&it);
                *self.g.cell_mut(&it) = self.v.cell(&it);
            }
            it.next();
        }
    }

    /// Right-hand side of the pressure-Poisson equation.
    fn compute_rhs(&mut self, dt: Real, geom: &Geometry) {
        let mut it = geom.interior();
        while it.valid() {
            if geom.cell_type_at(&it) == CellType::Fluid {
                *self.rhs.cell_mut(&it) = (self.f.dx_l(&it) + self.g.dy_l(&it)) / dt;
            }
            it.next();
        }
    }

    /// Velocity correction with the new pressure gradient.
    fn new_velocities(&mut self, dt: Real, geom: &Geometry) {
        let mut it = geom.interior();
        while it.valid() {
            if geom.cell_type_at(&it) == CellType::Fluid {
                *self.u.cell_mut(&it) = self.f.cell(&it) - dt * self.p.dx_r(&it);
                *self.v.cell_mut(&it) = self.g.cell(&it) - dt * self.p.dy_r(&it);
            }
            it.next();
        }
    }

    /// True when this rank's subdomain contains the global position. The
    /// ranks holding a global right/top edge close their interval so a
    /// point on an interior seam has exactly one owner.
    fn owns_point(&self, geom: &Geometry, comm: &Communicator, pos: MultiReal) -> bool {
        let h = geom.mesh();
        let e = geom.extent();
        let x0 = e[0] as Real * h.x;
        let x1 = e[1] as Real * h.x;
        let y0 = e[2] as Real * h.y;
        let y1 = e[3] as Real * h.y;
        let in_x = pos.x >= x0 && (pos.x < x1 || (comm.is_right() && pos.x <= x1));
        let in_y = pos.y >= y0 && (pos.y < y1 || (comm.is_top() && pos.y <= y1));
        in_x && in_y
    }

    /// Velocity at a global position, agreed on by all ranks: the owner
    /// interpolates, everyone sums.
    fn velocity_at(
        &self,
        geom: &Geometry,
        comm: &Communicator,
        pos: MultiReal,
    ) -> Result<MultiReal, SimError> {
        let mut vel = MultiReal::new(0.0, 0.0);
        if self.owns_point(geom, comm, pos) {
            let h = geom.mesh();
            let e = geom.extent();
            let local = MultiReal::new(
                pos.x - e[0] as Real * h.x,
                pos.y - e[2] as Real * h.y,
            );
            vel = MultiReal::new(self.u.interpolate(local), self.v.interpolate(local));
        }
        Ok(MultiReal::new(comm.all_sum(vel.x)?, comm.all_sum(vel.y)?))
    }

    /// Moves traces and streaklines with the interpolated velocity.
    /// Streaklines grow a fresh head at their seed every step; traces
    /// append on print steps and replace their head otherwise.
    fn advance_particles(
        &mut self,
        dt: Real,
        print: bool,
        geom: &Geometry,
        comm: &Communicator,
    ) -> Result<(), SimError> {
        let total = geom.total_length();
        let clamp = |p: MultiReal| {
            MultiReal::new(p.x.clamp(0.0, total.x), p.y.clamp(0.0, total.y))
        };

        for li in 0..self.traces.len() {
            let Some(&head) = self.traces[li].last() else {
                continue;
            };
            let vel = self.velocity_at(geom, comm, head)?;
            let moved = clamp(MultiReal::new(head.x + dt * vel.x, head.y + dt * vel.y));
            if print {
                self.traces[li].push(moved);
            } else if let Some(last) = self.traces[li].last_mut() {
                *last = moved;
            }
        }

        for li in 0..self.streaklines.len() {
            for pi in 0..self.streaklines[li].len() {
                let pos = self.streaklines[li][pi];
                let vel = self.velocity_at(geom, comm, pos)?;
                self.streaklines[li][pi] =
                    clamp(MultiReal::new(pos.x + dt * vel.x, pos.y + dt * vel.y));
            }
            let seed = self.streak_seeds[li];
            self.streaklines[li].push(seed);
        }
        Ok(())
    }

    /// Ends the run when any field left the stable range, with every rank
    /// agreeing on the verdict.
    fn check_overflow(&self, comm: &Communicator) -> Result<(), SimError> {
        let mut worst = self.u.abs_max().max(self.v.abs_max());
        if let Some(s) = &self.substance {
            worst = worst.max(s.abs_max());
        }
        let bad = !worst.is_finite() || worst > OVERFLOW_LIMIT;
        let flag = comm.all_max(if bad { 1.0 } else { 0.0 })?;
        if flag > 0.0 {
            return Err(SimError::NumericFailure(format!(
                "velocity or concentration magnitude {} left the stable range",
                worst
            )));
        }
        Ok(())
    }

    /// Velocity magnitude at the cell corners, for visualization output.
    pub fn velocity(&mut self) -> &Grid {
        let mut it = self.u.iter();
        while it.valid() {
            let um = 0.5 * (self.u.cell(&it) + self.u.cell(&it.top()));
            let vm = 0.5 * (self.v.cell(&it) + self.v.cell(&it.right()));
            *self.tmp.cell_mut(&it) = (um * um + vm * vm).sqrt();
            it.next();
        }
        &self.tmp
    }

    /// Vorticity du/dy - dv/dx at the cell corners.
    pub fn vorticity(&mut self) -> &Grid {
        let mut it = self.u.iter();
        while it.valid() {
            *self.vort.cell_mut(&it) = self.u.dy_r(&it) - self.v.dx_r(&it);
            it.next();
        }
        &self.vort
    }

    /// Stream function, integrated from the bottom-left corner.
    pub fn stream_function(&mut self) -> &Grid {
        let size = self.u.size();
        let h = self.u.mesh();
        for x in 0..size.x {
            let psi = if x == 0 {
                0.0
            } else {
                self.stream.cell_at(x - 1) - self.v.cell_at(x) * h.x
            };
            *self.stream.cell_at_mut(x) = psi;
        }
        for y in 1..size.y {
            for x in 0..size.x {
                let below = self.stream.cell_at((y - 1) * size.x + x);
                let psi = below + self.u.cell_at(y * size.x + x) * h.y;
                *self.stream.cell_at_mut(y * size.x + x) = psi;
            }
        }
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn quiet_cavity() -> (Geometry, Parameter) {
        // The default cavity with the lid switched off: every boundary
        // value is zero.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "size 8 8").unwrap();
        writeln!(file, "length 1.0 1.0").unwrap();
        writeln!(file, "velocity 0 0 0 0 0 0 0 0").unwrap();
        let mut geom = Geometry::new();
        geom.load(file.path()).unwrap();
        (geom, Parameter::new())
    }

    #[test]
    fn zero_state_is_a_fixpoint() {
        let (geom, param) = quiet_cavity();
        let comm = Communicator::single();
        let solver = Solver::red_black(&geom, param.omega);
        let mut comp = Compute::new(&geom, &comm, solver, None);

        for _ in 0..20 {
            let report = comp.time_step(&geom, &param, &comm).unwrap();
            assert!(report.dt > 0.0);
        }
        assert_eq!(comp.u().abs_max(), 0.0);
        assert_eq!(comp.v().abs_max(), 0.0);
        assert_eq!(comp.p().abs_max(), 0.0);
    }

    #[test]
    fn residual_bound_holds_after_the_pressure_loop() {
        let geom = Geometry::new();
        let param = Parameter::new();
        let comm = Communicator::single();
        let solver = Solver::red_black(&geom, param.omega);
        let mut comp = Compute::new(&geom, &comm, solver, None);

        let report = comp.time_step(&geom, &param, &comm).unwrap();
        assert!(report.converged, "residual {}", report.residual);
        assert!(report.residual < param.eps);
    }

    #[test]
    fn fixed_output_cadence_shortens_the_step() {
        let (geom, mut param) = quiet_cavity();
        param.fixed_dt = 0.07;
        let comm = Communicator::single();
        let solver = Solver::red_black(&geom, param.omega);
        let mut comp = Compute::new(&geom, &comm, solver, None);

        let mut printed_at = Vec::new();
        for _ in 0..12 {
            let report = comp.time_step(&geom, &param, &comm).unwrap();
            if report.print {
                printed_at.push(comp.time());
            }
        }
        assert!(!printed_at.is_empty());
        for t in printed_at {
            let phase = t / 0.07 - (t / 0.07).round();
            assert!(phase.abs() < 1e-9, "print instant off the grid: {}", t);
        }
    }

    #[test]
    fn fixed_stepping_uses_the_configured_dt() {
        let (geom, mut param) = quiet_cavity();
        param.tau = 0.0;
        param.dt = 0.025;
        let comm = Communicator::single();
        let solver = Solver::red_black(&geom, param.omega);
        let mut comp = Compute::new(&geom, &comm, solver, None);

        let report = comp.time_step(&geom, &param, &comm).unwrap();
        assert_eq!(report.dt, 0.025);
    }

    #[test]
    fn closed_box_conserves_mass() {
        let (geom, param) = quiet_cavity();
        let comm = Communicator::single();
        let solver = Solver::red_black(&geom, param.omega);
        let mut comp = Compute::new(&geom, &comm, solver, None);
        for _ in 0..5 {
            comp.time_step(&geom, &param, &comm).unwrap();
        }

        // Net flux through the boundary of the closed box.
        let size = geom.size();
        let h = geom.mesh();
        let mut flux = 0.0;
        for y in 1..size.y - 1 {
            flux += comp.u().cell_at(y * size.x + size.x - 2) * h.y;
            flux -= comp.u().cell_at(y * size.x) * h.y;
        }
        for x in 1..size.x - 1 {
            flux += comp.v().cell_at((size.y - 2) * size.x + x) * h.x;
            flux -= comp.v().cell_at(x) * h.x;
        }
        let perimeter = 2.0 * (geom.total_length().x + geom.total_length().y);
        assert!(flux.abs() <= param.eps * perimeter, "net flux {}", flux);
    }

    #[test]
    fn streaklines_grow_and_traces_follow() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "size 8 8").unwrap();
        writeln!(file, "trace 0.5 0.5").unwrap();
        writeln!(file, "streakline 0.3 0.7").unwrap();
        let mut geom = Geometry::new();
        geom.load(file.path()).unwrap();

        let param = Parameter::new();
        let comm = Communicator::single();
        let solver = Solver::red_black(&geom, param.omega);
        let mut comp = Compute::new(&geom, &comm, solver, None);

        for _ in 0..4 {
            comp.time_step(&geom, &param, &comm).unwrap();
        }
        assert_eq!(comp.traces().len(), 1);
        // Head only, since no print step occurred.
        assert_eq!(comp.traces()[0].len(), 1);
        // One fresh head per step plus the seed.
        assert_eq!(comp.streaklines()[0].len(), 5);
    }
}
