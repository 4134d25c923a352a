//! Coupled substance transport: N concentration fields advected by the
//! velocity, diffusing, and reacting with each other.
//!
//! The per-species update is explicit Euler on the interior fluid cells:
//! diffusion, donor-cell convection, a logistic self term, and pairwise
//! reaction terms. The pairwise terms are precomputed per cell from the
//! old concentrations before any species is overwritten, so the coupled
//! update stays synchronous.

use std::path::Path;

use tracing::debug;

use crate::comm::Communicator;
use crate::geometry::{CellType, Geometry};
use crate::grid::Grid;
use crate::{Index, MultiReal, Real, SimError};

pub struct Substance {
    n: Index,
    /// One concentration grid per species, on the pressure staggering.
    c: Vec<Grid>,
    /// Diffusion coefficient per species.
    d: Vec<Real>,
    /// Population limit of the logistic term per species.
    l: Vec<Real>,
    /// Donor-cell weight per species.
    gamma: Vec<Real>,
    /// Reaction coefficients, n x n row-major. The diagonal drives the
    /// logistic growth, off-diagonal entries the pairwise interactions.
    r: Vec<Real>,
    /// Uniform background concentration applied before shape init.
    concentration: Real,
    /// Scratch for the per-cell pairwise terms.
    rt: Vec<Real>,
}

fn pressure_offset(geom: &Geometry) -> MultiReal {
    MultiReal::new(geom.mesh().x / 2.0, geom.mesh().y / 2.0)
}

impl Substance {
    /// A single slowly diffusing species seeded as a small circle, the
    /// setup used when no substance file is given.
    pub fn new(geom: &Geometry) -> Self {
        let mut s = Substance {
            n: 1,
            c: vec![Grid::with_offset(geom, pressure_offset(geom))],
            d: vec![0.001],
            l: vec![1.0],
            gamma: vec![0.5],
            r: vec![0.0001],
            concentration: 0.0,
            rt: vec![0.0],
        };
        s.init_circle(geom, MultiReal::new(0.15, 0.6), 0.01, 1.0);
        s
    }

    /// Builds a substance system from explicit coefficient tables.
    /// `d`, `l` and `gamma` must have one entry per species, `r` one per
    /// species pair.
    pub fn with_coefficients(
        geom: &Geometry,
        d: Vec<Real>,
        l: Vec<Real>,
        gamma: Vec<Real>,
        r: Vec<Real>,
    ) -> Result<Self, SimError> {
        let n = d.len();
        if n == 0 {
            return Err(SimError::InvalidConfig(
                "substance system needs at least one species".into(),
            ));
        }
        if l.len() != n || gamma.len() != n || r.len() != n * n {
            return Err(SimError::InvalidConfig(format!(
                "coefficient tables disagree on the species count: d {}, l {}, gamma {}, r {}",
                n,
                l.len(),
                gamma.len(),
                r.len()
            )));
        }
        if l.iter().any(|v| *v <= 0.0) {
            return Err(SimError::InvalidConfig(
                "population limits must be positive".into(),
            ));
        }
        Ok(Substance {
            n: n as Index,
            c: (0..n)
                .map(|_| Grid::with_offset(geom, pressure_offset(geom)))
                .collect(),
            d,
            l,
            gamma,
            r,
            concentration: 0.0,
            rt: vec![0.0; n],
        })
    }

    /// Loads a substance file: `n N`, `concentration c`, `d d1..dN`,
    /// `r R11..RNN` (row-major), `l L1..LN`, `gamma g1..gN`, and an
    /// `init free` bit map or `init circle`. The species count must come
    /// before the coefficient tables.
    pub fn load(geom: &Geometry, path: &Path) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path).map_err(|e| SimError::io(path, e))?;
        let mut subst = Substance::with_coefficients(
            geom,
            vec![0.001],
            vec![1.0],
            vec![0.5],
            vec![0.0001],
        )?;

        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else {
                continue;
            };
            match key {
                "n" => {
                    let n: Index = parse(tokens.next(), "n")?;
                    if n == 0 {
                        return Err(SimError::InvalidConfig(
                            "substance system needs at least one species".into(),
                        ));
                    }
                    subst.n = n;
                    let n = n as usize;
                    subst.c = (0..n)
                        .map(|_| Grid::with_offset(geom, pressure_offset(geom)))
                        .collect();
                    subst.d = vec![0.0; n];
                    subst.l = vec![1.0; n];
                    subst.gamma = vec![0.5; n];
                    subst.r = vec![0.0; n * n];
                    subst.rt = vec![0.0; n];
                }
                "concentration" => subst.concentration = parse(tokens.next(), "concentration")?,
                "d" => {
                    for i in 0..subst.n as usize {
                        subst.d[i] = parse(tokens.next(), "d")?;
                    }
                }
                "r" => {
                    for i in 0..(subst.n * subst.n) as usize {
                        subst.r[i] = parse(tokens.next(), "r")?;
                    }
                }
                "l" => {
                    for i in 0..subst.n as usize {
                        subst.l[i] = parse(tokens.next(), "l")?;
                        if subst.l[i] <= 0.0 {
                            return Err(SimError::InvalidConfig(
                                "population limits must be positive".into(),
                            ));
                        }
                    }
                }
                "gamma" => {
                    for i in 0..subst.n as usize {
                        subst.gamma[i] = parse(tokens.next(), "gamma")?;
                    }
                }
                "init" => {
                    subst.fill_fluid(geom, subst.concentration);
                    match tokens.next() {
                        Some("free") => subst.init_free(geom, &mut lines)?,
                        Some("circle") => {
                            subst.init_circle(geom, MultiReal::new(0.15, 0.6), 0.01, 0.5)
                        }
                        other => {
                            return Err(SimError::InvalidConfig(format!(
                                "unknown substance init '{}'",
                                other.unwrap_or("")
                            )));
                        }
                    }
                }
                other => {
                    debug!(key = other, "ignoring unknown substance key");
                }
            }
        }
        Ok(subst)
    }

    pub fn n(&self) -> Index {
        self.n
    }

    pub fn species(&self, i: usize) -> &Grid {
        &self.c[i]
    }

    pub fn species_mut(&mut self, i: usize) -> &mut Grid {
        &mut self.c[i]
    }

    /// Largest concentration magnitude over all species, for the overflow
    /// check.
    pub fn abs_max(&self) -> Real {
        self.c.iter().fold(0.0, |m, g| m.max(g.abs_max()))
    }

    /// Sets every interior fluid cell of every species to `value`.
    fn fill_fluid(&mut self, geom: &Geometry, value: Real) {
        let mut it = geom.interior();
        while it.valid() {
            if geom.cell_type_at(&it) == CellType::Fluid {
                for c in &mut self.c {
                    *c.cell_mut(&it) = value;
                }
            }
            it.next();
        }
    }

    /// Seeds every species with a filled circle. `center` and `radius`
    /// are fractions of the domain length.
    pub fn init_circle(&mut self, geom: &Geometry, center: MultiReal, radius: Real, value: Real) {
        let total = geom.total_length();
        let mut it = geom.interior();
        while it.valid() {
            if geom.cell_type_at(&it) == CellType::Fluid {
                let pos = geom.global_cell_center(&it);
                let dx = pos.x - center.x * total.x;
                let dy = pos.y - center.y * total.y;
                let inside = (dx * dx + dy * dy).sqrt() <= radius * total.y;
                for c in &mut self.c {
                    *c.cell_mut(&it) = if inside { value } else { 0.0 };
                }
            }
            it.next();
        }
    }

    /// Reads the bit-encoded free map: one digit per cell, rows top-down
    /// over the global grid; bit `i` of a digit sets species `i` to 1.0.
    fn init_free<'a>(
        &mut self,
        geom: &Geometry,
        lines: &mut impl Iterator<Item = &'a str>,
    ) -> Result<(), SimError> {
        let bsize = geom.total_size();
        for j in 0..bsize.y {
            let Some(line) = lines.next() else {
                return Err(SimError::InvalidConfig(format!(
                    "substance init map ended after {} of {} rows",
                    j, bsize.y
                )));
            };
            let gy = bsize.y - 1 - j;
            for (i, b) in line.bytes().take(bsize.x as usize).enumerate() {
                if !b.is_ascii_digit() {
                    return Err(SimError::InvalidConfig(format!(
                        "substance init map accepts digits only, got '{}'",
                        b as char
                    )));
                }
                let mask = b - b'0';
                let Some(local) = geom.global_to_local(i as Index, gy) else {
                    continue;
                };
                let idx = local.y * geom.size().x + local.x;
                for (s, c) in self.c.iter_mut().enumerate() {
                    if mask & (1 << s) != 0 {
                        *c.cell_at_mut(idx) = 1.0;
                    }
                }
            }
        }
        Ok(())
    }

    /// Advances every species by one explicit Euler step, then refreshes
    /// ghost layers and boundary conditions.
    pub fn step(
        &mut self,
        dt: Real,
        u: &Grid,
        v: &Grid,
        geom: &Geometry,
        comm: &Communicator,
    ) -> Result<(), SimError> {
        let n = self.n as usize;
        let mut it = geom.interior();
        while it.valid() {
            if geom.cell_type_at(&it) == CellType::Fluid {
                // Pairwise terms from the old values, before any species
                // at this cell is overwritten.
                for s in 0..n {
                    self.rt[s] = 0.0;
                    for o in 0..n {
                        if s != o {
                            self.rt[s] +=
                                self.r[s * n + o] * self.c[s].cell(&it) * self.c[o].cell(&it);
                        }
                    }
                }

                for s in 0..n {
                    let cs = self.c[s].cell(&it);
                    let diffusion = self.d[s] * (self.c[s].dxx(&it) + self.c[s].dyy(&it));
                    let conv_x = self.c[s].dc_dcu_x(&it, self.gamma[s], u);
                    let conv_y = self.c[s].dc_dcv_y(&it, self.gamma[s], v);
                    let logistic = self.r[s * n + s] * cs * (self.l[s] - cs) / self.l[s];
                    *self.c[s].cell_mut(&it) =
                        cs + dt * (diffusion - conv_x - conv_y + logistic + self.rt[s]);
                }
            }
            it.next();
        }

        for c in &mut self.c {
            comm.exchange_boundary(c)?;
            geom.apply_boundary_c(comm, c);
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(token: Option<&str>, key: &str) -> Result<T, SimError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| SimError::InvalidConfig(format!("malformed value for substance '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_substance_is_a_seeded_circle() {
        let geom = Geometry::new();
        let s = Substance::new(&geom);
        assert_eq!(s.n(), 1);
        // The seed is tiny but the field stays bounded by the seed value.
        assert!(s.species(0).max() <= 1.0);
        assert!(s.species(0).min() >= 0.0);
    }

    #[test]
    fn coefficient_tables_must_agree() {
        let geom = Geometry::new();
        let bad = Substance::with_coefficients(
            &geom,
            vec![0.1, 0.2],
            vec![1.0],
            vec![0.5, 0.5],
            vec![0.0; 4],
        );
        assert!(matches!(bad, Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn load_two_species_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "n 2").unwrap();
        writeln!(file, "d 0.01 0.02").unwrap();
        writeln!(file, "r -0.13 0.019 -0.08 0.1").unwrap();
        writeln!(file, "l 2.0 10.0").unwrap();
        writeln!(file, "gamma 0.5 0.6").unwrap();

        let geom = Geometry::new();
        let s = Substance::load(&geom, file.path()).unwrap();
        assert_eq!(s.n(), 2);
        assert_eq!(s.d, vec![0.01, 0.02]);
        assert_eq!(s.r, vec![-0.13, 0.019, -0.08, 0.1]);
        assert_eq!(s.l, vec![2.0, 10.0]);
        assert_eq!(s.gamma, vec![0.5, 0.6]);
    }

    #[test]
    fn free_init_map_sets_species_bits() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "n 2").unwrap();
        writeln!(file, "d 0 0").unwrap();
        writeln!(file, "init free").unwrap();
        // 10 columns x 10 rows for the default 8x8 cavity, top-down.
        for row in 0..10 {
            let line = if row == 5 { "0030000000" } else { "0000000000" };
            writeln!(file, "{}", line).unwrap();
        }

        let geom = Geometry::new();
        let s = Substance::load(&geom, file.path()).unwrap();
        // Digit 3 = bits 0 and 1, at global (2, 4).
        let idx = 4 * geom.size().x + 2;
        assert_eq!(s.species(0).cell_at(idx), 1.0);
        assert_eq!(s.species(1).cell_at(idx), 1.0);
        assert_eq!(s.species(0).cell_at(idx + 1), 0.0);
    }

    #[test]
    fn two_species_reaction_oscillates_within_bounds() {
        // The reaction benchmark without transport: no diffusion, no
        // velocity, every fluid cell runs the same 0-d system.
        let geom = Geometry::new();
        let comm = Communicator::single();
        let mut s = Substance::with_coefficients(
            &geom,
            vec![0.0, 0.0],
            vec![2.0, 10.0],
            vec![0.0, 0.0],
            vec![-0.13, 0.019, -0.08, 0.1],
        )
        .unwrap();
        s.species_mut(0).initialize(0.4);
        s.species_mut(1).initialize(1.3);

        let u = Grid::new(&geom);
        let v = Grid::new(&geom);
        let probe = 4 * geom.size().x + 4;

        let dt = 0.05;
        let steps = (500.0 / dt) as usize;
        let mut lo = Real::MAX;
        let mut hi = Real::MIN;
        for step in 0..steps {
            s.step(dt, &u, &v, &geom, &comm).unwrap();
            let c0 = s.species(0).cell_at(probe);
            let c1 = s.species(1).cell_at(probe);
            assert!(c0.is_finite() && c1.is_finite(), "NaN at step {}", step);
            assert!(c0 >= 0.0 && c1 >= 0.0, "negative concentration at {}", step);
            assert!(c0 < 20.0 && c1 < 20.0, "runaway at step {}", step);
            if step > steps / 2 {
                lo = lo.min(c1);
                hi = hi.max(c1);
            }
        }
        // Sustained oscillation: the prey species keeps moving in the
        // second half of the run.
        assert!(hi - lo > 0.05, "no oscillation: [{}, {}]", lo, hi);
    }

    #[test]
    fn diffusion_spreads_a_peak() {
        let geom = Geometry::new();
        let comm = Communicator::single();
        let mut s = Substance::with_coefficients(
            &geom,
            vec![0.05],
            vec![1.0e6],
            vec![0.5],
            vec![0.0],
        )
        .unwrap();
        let center = 5 * geom.size().x + 5;
        *s.species_mut(0).cell_at_mut(center) = 1.0;

        let u = Grid::new(&geom);
        let v = Grid::new(&geom);
        for _ in 0..10 {
            s.step(0.01, &u, &v, &geom, &comm).unwrap();
        }
        let c = s.species(0);
        assert!(c.cell_at(center) < 1.0, "peak did not decay");
        assert!(c.cell_at(center + 1) > 0.0, "no mass reached the neighbor");
        assert!(c.cell_at(center) > c.cell_at(center + 1), "peak inverted");
    }
}
