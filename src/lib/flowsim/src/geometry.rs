//! Domain description: sizes, mesh, cell-type map, and boundary
//! enforcement.
//!
//! A geometry starts out as the lid-driven cavity, can be overwritten from
//! a scenario file, and is then recalculated against the communicator:
//! the global domain is split into per-rank subdomains, extents are
//! computed on the pre-ghost sizes, and one ghost ring is added per side,
//! exactly once. After that the solver treats the geometry as immutable.

use std::path::Path;

use tracing::{debug, warn};

use crate::comm::Communicator;
use crate::grid::Grid;
use crate::iterator::{
    BoundaryIterator, CellIterator, Edge, GridIter, InteriorIterator, ObstacleIterator,
};
use crate::{Index, MultiIndex, MultiReal, Real, SimError};

/// Cell classification, tagged with the ASCII byte used by the scenario
/// format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellType {
    Fluid,
    Obstacle,
    /// Uniform inflow with the configured edge velocity.
    Inflow,
    /// Parabolic inflow through a horizontal (bottom/top) edge.
    HInflow,
    /// Parabolic inflow through a vertical (left/right) edge.
    VInflow,
    Outflow,
    /// Slip wall on a vertical edge.
    VSlip,
    /// Slip wall on a horizontal edge.
    HSlip,
}

impl CellType {
    /// The scenario-format byte for this type.
    pub fn tag(self) -> u8 {
        match self {
            CellType::Fluid => b'.',
            CellType::Obstacle => b'#',
            CellType::Inflow => b'I',
            CellType::HInflow => b'H',
            CellType::VInflow => b'V',
            CellType::Outflow => b'O',
            CellType::VSlip => b'|',
            CellType::HSlip => b'-',
        }
    }

    pub fn from_byte(b: u8) -> Result<Self, SimError> {
        Ok(match b {
            b'.' => CellType::Fluid,
            b'#' => CellType::Obstacle,
            b'I' => CellType::Inflow,
            b'H' => CellType::HInflow,
            b'V' => CellType::VInflow,
            b'O' => CellType::Outflow,
            b'|' => CellType::VSlip,
            b'-' => CellType::HSlip,
            _ => {
                return Err(SimError::InvalidConfig(format!(
                    "unknown cell type byte '{}'",
                    b as char
                )));
            }
        })
    }
}

/// Dirichlet fixes the value on the wall, Neumann the normal derivative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondKind {
    Dirichlet,
    Neumann,
}

impl CondKind {
    fn from_byte(b: u8) -> Result<Self, SimError> {
        match b {
            b'd' => Ok(CondKind::Dirichlet),
            b'n' => Ok(CondKind::Neumann),
            _ => Err(SimError::InvalidConfig(format!(
                "boundary condition tag must be 'd' or 'n', got '{}'",
                b as char
            ))),
        }
    }
}

/// One boundary scalar: a value and how to impose it.
#[derive(Clone, Copy, Debug)]
pub struct EdgeCondition {
    pub value: Real,
    pub kind: CondKind,
}

impl EdgeCondition {
    fn dirichlet(value: Real) -> Self {
        EdgeCondition {
            value,
            kind: CondKind::Dirichlet,
        }
    }
}

pub struct Geometry {
    /// Global interior size in cells, without the ghost ring.
    inner: MultiIndex,
    /// Global size including the ghost ring.
    bsize: MultiIndex,
    /// Per-rank size including the ghost ring.
    size: MultiIndex,
    /// Global domain length.
    blength: MultiReal,
    /// Per-rank domain length.
    length: MultiReal,
    /// Mesh width, identical on every rank.
    h: MultiReal,
    invh: MultiReal,
    /// Global cell-type map, row-major, ghost ring included.
    bcells: Vec<CellType>,
    /// True once a scenario file provided the map.
    cells_loaded: bool,
    /// Per-rank slice of the cell-type map.
    cells: Vec<CellType>,
    /// Baked neighbor code per cell; non-zero only for interior obstacle
    /// cells. Bit set <=> that neighbor is non-Fluid, with weights
    /// down = 8, right = 4, up = 2, left = 1.
    codes: Vec<u8>,
    /// (u, v) condition per edge, in edge-numbering order.
    velocity: [[EdgeCondition; 2]; 4],
    /// Pressure condition per edge.
    pressure: [EdgeCondition; 4],
    /// Seed positions for particle traces.
    traces: Vec<MultiReal>,
    /// Seed positions for streaklines.
    streaklines: Vec<MultiReal>,
    /// This rank's extent (x0, x1, y0, y1) in pre-ghost cell coordinates.
    extent: [Index; 4],
    /// All extents, master rank only.
    extents: Option<Vec<[Index; 4]>>,
}

impl Geometry {
    /// The lid-driven cavity on the unit square: 8x8 interior cells,
    /// obstacle ring, lid velocity (1, 0) through the top edge.
    pub fn new() -> Self {
        let zero = EdgeCondition::dirichlet(0.0);
        let mut geom = Geometry {
            inner: MultiIndex::new(8, 8),
            bsize: MultiIndex::new(0, 0),
            size: MultiIndex::new(0, 0),
            blength: MultiReal::new(1.0, 1.0),
            length: MultiReal::new(0.0, 0.0),
            h: MultiReal::new(0.0, 0.0),
            invh: MultiReal::new(0.0, 0.0),
            bcells: Vec::new(),
            cells_loaded: false,
            cells: Vec::new(),
            codes: Vec::new(),
            velocity: [
                [zero, zero],
                [zero, zero],
                [EdgeCondition::dirichlet(1.0), zero],
                [zero, zero],
            ],
            pressure: [zero; 4],
            traces: Vec::new(),
            streaklines: Vec::new(),
            extent: [0; 4],
            extents: None,
        };
        if geom.recalc(None).is_err() {
            unreachable!("the default geometry is always valid");
        }
        geom
    }

    /// Overwrites this geometry from a scenario file.
    ///
    /// The format is line oriented: `size Nx Ny`, `length Lx Ly`,
    /// `velocity u1 v1 .. u4 v4`, `pressure p1 .. p4`, `v_type c1 .. c8`,
    /// `p_type c1 .. c4`, `trace x y`, `streakline x y`, and
    /// `geometry free` followed by one row of cell-type bytes per grid row,
    /// top-down. Edge order is bottom, right, top, left.
    pub fn load(&mut self, path: &Path) -> Result<(), SimError> {
        let text = std::fs::read_to_string(path).map_err(|e| SimError::io(path, e))?;
        let mut lines = text.lines();

        while let Some(line) = lines.next() {
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else {
                continue;
            };
            match key {
                "size" => {
                    self.inner = MultiIndex::new(
                        parse_value(tokens.next(), "size")?,
                        parse_value(tokens.next(), "size")?,
                    );
                    if self.inner.x < 1 || self.inner.y < 1 {
                        return Err(SimError::InvalidConfig(
                            "domain needs at least one interior cell per dimension".into(),
                        ));
                    }
                }
                "length" => {
                    self.blength = MultiReal::new(
                        parse_value(tokens.next(), "length")?,
                        parse_value(tokens.next(), "length")?,
                    );
                }
                "velocity" => {
                    for edge in 0..4 {
                        for comp in 0..2 {
                            self.velocity[edge][comp].value =
                                parse_value(tokens.next(), "velocity")?;
                        }
                    }
                }
                "pressure" => {
                    for edge in 0..4 {
                        self.pressure[edge].value = parse_value(tokens.next(), "pressure")?;
                    }
                }
                "v_type" => {
                    for edge in 0..4 {
                        for comp in 0..2 {
                            let tag = parse_tag(tokens.next(), "v_type")?;
                            self.velocity[edge][comp].kind = CondKind::from_byte(tag)?;
                        }
                    }
                }
                "p_type" => {
                    for edge in 0..4 {
                        let tag = parse_tag(tokens.next(), "p_type")?;
                        self.pressure[edge].kind = CondKind::from_byte(tag)?;
                    }
                }
                "trace" => {
                    self.traces.push(MultiReal::new(
                        parse_value(tokens.next(), "trace")?,
                        parse_value(tokens.next(), "trace")?,
                    ));
                }
                "streakline" => {
                    self.streaklines.push(MultiReal::new(
                        parse_value(tokens.next(), "streakline")?,
                        parse_value(tokens.next(), "streakline")?,
                    ));
                }
                "geometry" => {
                    if tokens.next() != Some("free") {
                        return Err(SimError::InvalidConfig(
                            "only 'geometry free' maps are supported".into(),
                        ));
                    }
                    self.read_free_map(&mut lines)?;
                }
                other => {
                    warn!(key = other, "ignoring unknown scenario key");
                }
            }
        }

        debug!(
            size = ?self.inner,
            length = ?self.blength,
            loaded_map = self.cells_loaded,
            "scenario loaded"
        );

        // Re-establish the serial view; a decomposed run recalculates
        // against its communicator afterwards.
        self.recalc(None)
    }

    /// Reads the free-geometry block: `(inner.y + 2)` rows of
    /// `(inner.x + 2)` cell-type bytes, first row on top. Rows are stored
    /// reversed into the row-major map so that index 0 is the bottom-left
    /// corner.
    fn read_free_map<'a>(
        &mut self,
        lines: &mut impl Iterator<Item = &'a str>,
    ) -> Result<(), SimError> {
        let w = (self.inner.x + 2) as usize;
        let rows = (self.inner.y + 2) as usize;
        let mut map = vec![CellType::Fluid; w * rows];

        for j in 0..rows {
            let Some(line) = lines.next() else {
                return Err(SimError::InvalidConfig(format!(
                    "free geometry block ended after {} of {} rows",
                    j, rows
                )));
            };
            if line.len() < w {
                return Err(SimError::InvalidConfig(format!(
                    "free geometry row {} has {} cells, expected {}",
                    j,
                    line.len(),
                    w
                )));
            }
            let y = rows - 1 - j;
            for (i, b) in line.bytes().take(w).enumerate() {
                map[y * w + i] = CellType::from_byte(b)?;
            }
        }

        self.bcells = map;
        self.cells_loaded = true;
        Ok(())
    }

    /// Splits the domain over the communicator's process grid and derives
    /// every computed quantity: mesh widths, extents, per-rank map, baked
    /// neighbor codes.
    pub fn recalculate(&mut self, comm: &Communicator) -> Result<(), SimError> {
        let (sub, tidx) = self.subdomain(comm)?;
        self.apply_split(sub, tidx)?;
        self.extents = comm.collect_extent(self.extent)?;
        Ok(())
    }

    fn recalc(&mut self, comm: Option<&Communicator>) -> Result<(), SimError> {
        let (sub, tidx) = match comm {
            None => (self.inner, MultiIndex::new(0, 0)),
            Some(c) => self.subdomain(c)?,
        };
        self.apply_split(sub, tidx)?;
        self.extents = Some(vec![self.extent]);
        Ok(())
    }

    /// Per-rank interior size and subdomain index for the supported
    /// layouts.
    fn subdomain(&self, comm: &Communicator) -> Result<(MultiIndex, MultiIndex), SimError> {
        let sub = match comm.size() {
            1 => self.inner,
            2 => {
                if self.inner.x % 2 != 0 {
                    return Err(SimError::InvalidConfig(format!(
                        "domain width {} does not split over 2 ranks",
                        self.inner.x
                    )));
                }
                MultiIndex::new(self.inner.x / 2, self.inner.y)
            }
            4 => {
                if self.inner.x % 2 != 0 || self.inner.y % 2 != 0 {
                    return Err(SimError::InvalidConfig(format!(
                        "domain {}x{} does not split over 4 ranks",
                        self.inner.x, self.inner.y
                    )));
                }
                MultiIndex::new(self.inner.x / 2, self.inner.y / 2)
            }
            n => {
                return Err(SimError::InvalidConfig(format!(
                    "unsupported process count: {}",
                    n
                )));
            }
        };
        Ok((sub, comm.thread_idx()))
    }

    fn apply_split(&mut self, sub: MultiIndex, tidx: MultiIndex) -> Result<(), SimError> {
        // Mesh widths come from the global interior.
        self.h = MultiReal::new(
            self.blength.x / self.inner.x as Real,
            self.blength.y / self.inner.y as Real,
        );
        self.invh = MultiReal::new(
            self.inner.x as Real / self.blength.x,
            self.inner.y as Real / self.blength.y,
        );

        // Extents on pre-ghost sizes; the ghost ring is added afterwards
        // and only once.
        self.extent = [
            tidx.x * sub.x,
            (tidx.x + 1) * sub.x,
            tidx.y * sub.y,
            (tidx.y + 1) * sub.y,
        ];
        self.size = MultiIndex::new(sub.x + 2, sub.y + 2);
        self.bsize = MultiIndex::new(self.inner.x + 2, self.inner.y + 2);
        self.length = MultiReal::new(
            sub.x as Real * self.h.x,
            sub.y as Real * self.h.y,
        );

        if !self.cells_loaded {
            self.bcells = default_cavity_map(self.bsize);
        } else if self.bcells.len() != (self.bsize.x * self.bsize.y) as usize {
            return Err(SimError::InvalidConfig(format!(
                "cell map has {} entries, domain needs {}",
                self.bcells.len(),
                self.bsize.x * self.bsize.y
            )));
        }

        self.validate_map()?;
        self.slice_rank_map();
        self.bake_neighbor_codes();
        Ok(())
    }

    /// The outer ring must be non-Fluid, and edge types must be
    /// geometrically possible on their edge.
    fn validate_map(&self) -> Result<(), SimError> {
        let w = self.bsize.x;
        let hgt = self.bsize.y;
        let at = |x: Index, y: Index| self.bcells[(y * w + x) as usize];

        for x in 0..w {
            for y in [0, hgt - 1] {
                if at(x, y) == CellType::Fluid {
                    return Err(SimError::InvalidConfig(format!(
                        "outer ring cell ({}, {}) must not be Fluid",
                        x, y
                    )));
                }
            }
        }
        for y in 0..hgt {
            for x in [0, w - 1] {
                if at(x, y) == CellType::Fluid {
                    return Err(SimError::InvalidConfig(format!(
                        "outer ring cell ({}, {}) must not be Fluid",
                        x, y
                    )));
                }
            }
        }

        // Corners belong to two edges; they are exempt from the
        // orientation check.
        for x in 1..w - 1 {
            for (y, name) in [(0, "bottom"), (hgt - 1, "top")] {
                let t = at(x, y);
                if t == CellType::VSlip || t == CellType::VInflow {
                    return Err(SimError::InvalidConfig(format!(
                        "{:?} is not valid on the {} edge",
                        t, name
                    )));
                }
            }
        }
        for y in 1..hgt - 1 {
            for (x, name) in [(0, "left"), (w - 1, "right")] {
                let t = at(x, y);
                if t == CellType::HSlip || t == CellType::HInflow {
                    return Err(SimError::InvalidConfig(format!(
                        "{:?} is not valid on the {} edge",
                        t, name
                    )));
                }
            }
        }
        Ok(())
    }

    fn slice_rank_map(&mut self) {
        let bw = self.bsize.x;
        self.cells.clear();
        self.cells.reserve((self.size.x * self.size.y) as usize);
        for y in 0..self.size.y {
            for x in 0..self.size.x {
                let gx = self.extent[0] + x;
                let gy = self.extent[2] + y;
                self.cells.push(self.bcells[(gy * bw + gx) as usize]);
            }
        }
    }

    /// Bakes the 4-bit neighbor code for every interior obstacle cell:
    /// bit set <=> that neighbor is non-Fluid, weights down = 8,
    /// right = 4, up = 2, left = 1.
    fn bake_neighbor_codes(&mut self) {
        self.codes = vec![0; (self.size.x * self.size.y) as usize];
        let mut it = InteriorIterator::new(self.size);
        while it.valid() {
            if self.cells[it.value() as usize] != CellType::Fluid {
                let nonfluid =
                    |n: CellIterator| (self.cells[n.value() as usize] != CellType::Fluid) as u8;
                self.codes[it.value() as usize] = nonfluid(it.down()) * 8
                    + nonfluid(it.right()) * 4
                    + nonfluid(it.top()) * 2
                    + nonfluid(it.left());
            }
            it.next();
        }
    }

    /// Per-rank size in cells, ghost ring included.
    pub fn size(&self) -> MultiIndex {
        self.size
    }

    /// Global size in cells, ghost ring included.
    pub fn total_size(&self) -> MultiIndex {
        self.bsize
    }

    /// Per-rank domain length.
    pub fn length(&self) -> MultiReal {
        self.length
    }

    /// Global domain length.
    pub fn total_length(&self) -> MultiReal {
        self.blength
    }

    pub fn mesh(&self) -> MultiReal {
        self.h
    }

    pub fn inv_mesh(&self) -> MultiReal {
        self.invh
    }

    /// This rank's extent (x0, x1, y0, y1) in pre-ghost cell coordinates.
    pub fn extent(&self) -> [Index; 4] {
        self.extent
    }

    /// Extent table of every rank; present on the master only.
    pub fn extents(&self) -> Option<&[[Index; 4]]> {
        self.extents.as_deref()
    }

    pub fn cell_type_at(&self, it: &impl GridIter) -> CellType {
        self.cells[it.value() as usize]
    }

    pub fn baked_neighbors(&self, it: &impl GridIter) -> u8 {
        self.codes[it.value() as usize]
    }

    pub fn traces(&self) -> &[MultiReal] {
        &self.traces
    }

    pub fn streaklines(&self) -> &[MultiReal] {
        &self.streaklines
    }

    pub fn iter(&self) -> CellIterator {
        CellIterator::new(self.size)
    }

    pub fn interior(&self) -> InteriorIterator {
        InteriorIterator::new(self.size)
    }

    pub fn boundary(&self, edge: Edge) -> BoundaryIterator {
        BoundaryIterator::new(self.size, edge)
    }

    pub fn obstacles(&self) -> ObstacleIterator<'_> {
        ObstacleIterator::new(self.size, &self.cells)
    }

    /// Maps a global cell coordinate into this rank, if it owns it.
    pub fn global_to_local(&self, gx: Index, gy: Index) -> Option<MultiIndex> {
        let x = gx.checked_sub(self.extent[0])?;
        let y = gy.checked_sub(self.extent[2])?;
        (x < self.size.x && y < self.size.y).then_some(MultiIndex::new(x, y))
    }

    /// Global physical position of a rank-local cell center.
    pub fn global_cell_center(&self, it: &impl GridIter) -> MultiReal {
        let p = it.pos();
        MultiReal::new(
            ((self.extent[0] + p.x) as Real - 0.5) * self.h.x,
            ((self.extent[2] + p.y) as Real - 0.5) * self.h.y,
        )
    }

    fn holds_edge(&self, comm: &Communicator, edge: Edge) -> bool {
        match edge {
            Edge::Bottom => comm.is_bottom(),
            Edge::Right => comm.is_right(),
            Edge::Top => comm.is_top(),
            Edge::Left => comm.is_left(),
        }
    }

    /// Parabolic inflow profile across the edge, scaled so the peak is
    /// `v0` at mid-span.
    fn parabolic(&self, edge: Edge, it: &impl GridIter, v0: Real) -> Real {
        let p = it.pos();
        let s = if edge.is_vertical() {
            ((self.extent[2] + p.y) as Real - 0.5) * self.h.y / self.blength.y
        } else {
            ((self.extent[0] + p.x) as Real - 0.5) * self.h.x / self.blength.x
        };
        let s = s.clamp(0.0, 1.0);
        4.0 * v0 * s * (1.0 - s)
    }

    /// Applies the configured boundary values to the u velocity field on
    /// every global edge this rank holds, then the interior obstacle
    /// treatment.
    pub fn apply_boundary_u(&self, comm: &Communicator, u: &mut Grid) {
        for edge in [Edge::Left, Edge::Right, Edge::Bottom, Edge::Top] {
            if !self.holds_edge(comm, edge) {
                continue;
            }
            let mut boit = self.boundary(edge);
            while boit.valid() {
                let cond = self.velocity[edge.slot()][0];
                match self.cell_type_at(&boit) {
                    CellType::Fluid => {}
                    CellType::Obstacle => self.set_u_dirichlet(u, &boit, edge, 0.0),
                    CellType::Inflow => match cond.kind {
                        CondKind::Dirichlet => self.set_u_dirichlet(u, &boit, edge, cond.value),
                        CondKind::Neumann => self.set_u_neumann(u, &boit, edge, cond.value),
                    },
                    CellType::VInflow => {
                        let profile = self.parabolic(edge, &boit, cond.value);
                        self.set_u_dirichlet(u, &boit, edge, profile);
                    }
                    CellType::HInflow => self.set_u_dirichlet(u, &boit, edge, 0.0),
                    CellType::Outflow => self.set_u_neumann(u, &boit, edge, 0.0),
                    CellType::VSlip => self.set_u_neumann(u, &boit, edge, 0.0),
                    CellType::HSlip => self.set_u_dirichlet(u, &boit, edge, 0.0),
                }
                boit.next();
            }
        }
        self.apply_obstacle_u(u);
    }

    /// Applies the configured boundary values to the v velocity field.
    pub fn apply_boundary_v(&self, comm: &Communicator, v: &mut Grid) {
        for edge in [Edge::Left, Edge::Right, Edge::Bottom, Edge::Top] {
            if !self.holds_edge(comm, edge) {
                continue;
            }
            let mut boit = self.boundary(edge);
            while boit.valid() {
                let cond = self.velocity[edge.slot()][1];
                match self.cell_type_at(&boit) {
                    CellType::Fluid => {}
                    CellType::Obstacle => self.set_v_dirichlet(v, &boit, edge, 0.0),
                    CellType::Inflow => match cond.kind {
                        CondKind::Dirichlet => self.set_v_dirichlet(v, &boit, edge, cond.value),
                        CondKind::Neumann => self.set_v_neumann(v, &boit, edge, cond.value),
                    },
                    CellType::VInflow => self.set_v_dirichlet(v, &boit, edge, 0.0),
                    CellType::HInflow => {
                        let profile = self.parabolic(edge, &boit, cond.value);
                        self.set_v_dirichlet(v, &boit, edge, profile);
                    }
                    CellType::Outflow => self.set_v_neumann(v, &boit, edge, 0.0),
                    CellType::VSlip => self.set_v_dirichlet(v, &boit, edge, 0.0),
                    CellType::HSlip => self.set_v_neumann(v, &boit, edge, 0.0),
                }
                boit.next();
            }
        }
        self.apply_obstacle_v(v);
    }

    /// Applies the configured boundary values to the pressure field,
    /// averages the four domain corners, and runs the interior obstacle
    /// treatment.
    pub fn apply_boundary_p(&self, comm: &Communicator, p: &mut Grid) {
        for edge in [Edge::Left, Edge::Right, Edge::Bottom, Edge::Top] {
            if !self.holds_edge(comm, edge) {
                continue;
            }
            let mut boit = self.boundary(edge);
            while boit.valid() {
                match self.cell_type_at(&boit) {
                    CellType::Fluid => {}
                    CellType::Obstacle
                    | CellType::Inflow
                    | CellType::VInflow
                    | CellType::HInflow => self.set_p_neumann(p, &boit, edge, 0.0),
                    CellType::Outflow => self.set_p_dirichlet(p, &boit, edge, 0.0),
                    CellType::VSlip | CellType::HSlip => {
                        self.set_p_dirichlet(p, &boit, edge, self.pressure[edge.slot()].value)
                    }
                }
                boit.next();
            }
        }
        self.average_corners(comm, p);
        self.apply_obstacle_p(p);
    }

    /// Applies the substance boundary treatment: zero Dirichlet on
    /// obstacle edge cells, zero Neumann elsewhere, corner averaging, and
    /// the sign-flipped reflective treatment on interior obstacles.
    pub fn apply_boundary_c(&self, comm: &Communicator, c: &mut Grid) {
        for edge in [Edge::Left, Edge::Right, Edge::Bottom, Edge::Top] {
            if !self.holds_edge(comm, edge) {
                continue;
            }
            let mut boit = self.boundary(edge);
            while boit.valid() {
                match self.cell_type_at(&boit) {
                    CellType::Fluid => {}
                    CellType::Obstacle => self.set_p_dirichlet(c, &boit, edge, 0.0),
                    _ => self.set_p_neumann(c, &boit, edge, 0.0),
                }
                boit.next();
            }
        }
        self.average_corners(comm, c);
        self.apply_obstacle_c(c);
    }

    /// Sets the four corner ghost cells to the average of their two
    /// interior neighbors.
    fn average_corners(&self, comm: &Communicator, g: &mut Grid) {
        if comm.is_bottom() && comm.is_left() {
            let it = BoundaryIterator::corner_bottom_left(self.size);
            *g.cell_mut(&it) = 0.5 * (g.cell(&it.right()) + g.cell(&it.top()));
        }
        if comm.is_bottom() && comm.is_right() {
            let it = BoundaryIterator::corner_bottom_right(self.size);
            *g.cell_mut(&it) = 0.5 * (g.cell(&it.left()) + g.cell(&it.top()));
        }
        if comm.is_top() && comm.is_left() {
            let it = BoundaryIterator::corner_top_left(self.size);
            *g.cell_mut(&it) = 0.5 * (g.cell(&it.right()) + g.cell(&it.down()));
        }
        if comm.is_top() && comm.is_right() {
            let it = BoundaryIterator::corner_top_right(self.size);
            *g.cell_mut(&it) = 0.5 * (g.cell(&it.left()) + g.cell(&it.down()));
        }
    }

    // The edge setters choose the formula so the discrete condition is
    // second-order accurate at the wall. For u the wall coincides with the
    // sample point on the vertical edges; on the right edge it sits one
    // column inside the ghost, so both columns take the wall value.

    fn set_u_dirichlet(&self, u: &mut Grid, it: &impl GridIter, edge: Edge, value: Real) {
        match edge {
            Edge::Bottom => *u.cell_mut(it) = 2.0 * value - u.cell(&it.top()),
            Edge::Top => *u.cell_mut(it) = 2.0 * value - u.cell(&it.down()),
            Edge::Left => *u.cell_mut(it) = value,
            Edge::Right => {
                *u.cell_mut(it) = value;
                *u.cell_mut(&it.left()) = value;
            }
        }
    }

    fn set_u_neumann(&self, u: &mut Grid, it: &impl GridIter, edge: Edge, value: Real) {
        match edge {
            Edge::Bottom => *u.cell_mut(it) = u.cell(&it.top()) - self.h.y * value,
            Edge::Top => *u.cell_mut(it) = u.cell(&it.down()) + self.h.y * value,
            Edge::Left => *u.cell_mut(it) = u.cell(&it.right()) - self.h.x * value,
            Edge::Right => *u.cell_mut(it) = u.cell(&it.left()) + self.h.x * value,
        }
    }

    fn set_v_dirichlet(&self, v: &mut Grid, it: &impl GridIter, edge: Edge, value: Real) {
        match edge {
            Edge::Left => *v.cell_mut(it) = 2.0 * value - v.cell(&it.right()),
            Edge::Right => *v.cell_mut(it) = 2.0 * value - v.cell(&it.left()),
            Edge::Bottom => *v.cell_mut(it) = value,
            Edge::Top => {
                *v.cell_mut(it) = value;
                *v.cell_mut(&it.down()) = value;
            }
        }
    }

    fn set_v_neumann(&self, v: &mut Grid, it: &impl GridIter, edge: Edge, value: Real) {
        match edge {
            Edge::Bottom => *v.cell_mut(it) = v.cell(&it.top()) - self.h.y * value,
            Edge::Top => *v.cell_mut(it) = v.cell(&it.down()) + self.h.y * value,
            Edge::Left => *v.cell_mut(it) = v.cell(&it.right()) - self.h.x * value,
            Edge::Right => *v.cell_mut(it) = v.cell(&it.left()) + self.h.x * value,
        }
    }

    /// Also used for substance fields, which live on the same staggering
    /// as the pressure.
    fn set_p_dirichlet(&self, p: &mut Grid, it: &impl GridIter, edge: Edge, value: Real) {
        match edge {
            Edge::Bottom => *p.cell_mut(it) = 2.0 * value - p.cell(&it.top()),
            Edge::Right => *p.cell_mut(it) = 2.0 * value - p.cell(&it.left()),
            Edge::Top => *p.cell_mut(it) = 2.0 * value - p.cell(&it.down()),
            Edge::Left => *p.cell_mut(it) = 2.0 * value - p.cell(&it.right()),
        }
    }

    fn set_p_neumann(&self, p: &mut Grid, it: &impl GridIter, edge: Edge, value: Real) {
        match edge {
            Edge::Bottom => *p.cell_mut(it) = p.cell(&it.top()) - self.h.y * value,
            Edge::Right => *p.cell_mut(it) = p.cell(&it.left()) + self.h.x * value,
            Edge::Top => *p.cell_mut(it) = p.cell(&it.down()) + self.h.y * value,
            Edge::Left => *p.cell_mut(it) = p.cell(&it.right()) - self.h.x * value,
        }
    }

    /// Interior obstacle treatment for u, selected by the baked neighbor
    /// code. Codes with one fluid face mirror the tangential component and
    /// zero the wall faces; corner codes combine both.
    fn apply_obstacle_u(&self, u: &mut Grid) {
        let mut oit = self.obstacles();
        while oit.valid() {
            match self.baked_neighbors(&oit) {
                13 => *u.cell_mut(&oit) = -u.cell(&oit.top()),
                11 => *u.cell_mut(&oit) = 0.0,
                7 => *u.cell_mut(&oit) = -u.cell(&oit.down()),
                14 => {
                    *u.cell_mut(&oit) = 0.0;
                    *u.cell_mut(&oit.left()) = 0.0;
                }
                3 => *u.cell_mut(&oit) = 0.0,
                9 => *u.cell_mut(&oit) = 0.0,
                12 => {
                    *u.cell_mut(&oit) = -u.cell(&oit.top());
                    *u.cell_mut(&oit.left()) = 0.0;
                }
                6 => {
                    *u.cell_mut(&oit) = -u.cell(&oit.down());
                    *u.cell_mut(&oit.left()) = 0.0;
                }
                _ => {}
            }
            oit.next();
        }
    }

    /// Interior obstacle treatment for v.
    fn apply_obstacle_v(&self, v: &mut Grid) {
        let mut oit = self.obstacles();
        while oit.valid() {
            match self.baked_neighbors(&oit) {
                13 => *v.cell_mut(&oit) = 0.0,
                11 => *v.cell_mut(&oit) = -v.cell(&oit.right()),
                7 => {
                    *v.cell_mut(&oit) = 0.0;
                    *v.cell_mut(&oit.down()) = 0.0;
                }
                14 => *v.cell_mut(&oit) = -v.cell(&oit.left()),
                3 => {
                    *v.cell_mut(&oit) = -v.cell(&oit.right());
                    *v.cell_mut(&oit.down()) = 0.0;
                }
                9 => *v.cell_mut(&oit) = 0.0,
                12 => *v.cell_mut(&oit) = 0.0,
                6 => {
                    *v.cell_mut(&oit) = -v.cell(&oit.left());
                    *v.cell_mut(&oit.down()) = 0.0;
                }
                _ => {}
            }
            oit.next();
        }
    }

    /// Interior obstacle treatment for p: copy from the fluid side, or the
    /// average of both fluid sides at corners.
    fn apply_obstacle_p(&self, p: &mut Grid) {
        let mut oit = self.obstacles();
        while oit.valid() {
            match self.baked_neighbors(&oit) {
                13 => *p.cell_mut(&oit) = p.cell(&oit.top()),
                11 => *p.cell_mut(&oit) = p.cell(&oit.right()),
                7 => *p.cell_mut(&oit) = p.cell(&oit.down()),
                14 => *p.cell_mut(&oit) = p.cell(&oit.left()),
                3 => *p.cell_mut(&oit) = 0.5 * (p.cell(&oit.right()) + p.cell(&oit.down())),
                9 => *p.cell_mut(&oit) = 0.5 * (p.cell(&oit.right()) + p.cell(&oit.top())),
                12 => *p.cell_mut(&oit) = 0.5 * (p.cell(&oit.left()) + p.cell(&oit.top())),
                6 => *p.cell_mut(&oit) = 0.5 * (p.cell(&oit.left()) + p.cell(&oit.down())),
                _ => {}
            }
            oit.next();
        }
    }

    /// Interior obstacle treatment for substance fields: reflective with a
    /// flipped sign so the wall concentration is zero.
    fn apply_obstacle_c(&self, c: &mut Grid) {
        let mut oit = self.obstacles();
        while oit.valid() {
            match self.baked_neighbors(&oit) {
                13 => *c.cell_mut(&oit) = -c.cell(&oit.top()),
                11 => *c.cell_mut(&oit) = -c.cell(&oit.right()),
                7 => *c.cell_mut(&oit) = -c.cell(&oit.down()),
                14 => *c.cell_mut(&oit) = -c.cell(&oit.left()),
                3 => *c.cell_mut(&oit) = -0.5 * (c.cell(&oit.right()) + c.cell(&oit.down())),
                9 => *c.cell_mut(&oit) = -0.5 * (c.cell(&oit.right()) + c.cell(&oit.top())),
                12 => *c.cell_mut(&oit) = -0.5 * (c.cell(&oit.left()) + c.cell(&oit.top())),
                6 => *c.cell_mut(&oit) = -0.5 * (c.cell(&oit.left()) + c.cell(&oit.down())),
                _ => {}
            }
            oit.next();
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new()
    }
}

/// Obstacle ring with the lid (top row) marked as inflow.
fn default_cavity_map(bsize: MultiIndex) -> Vec<CellType> {
    let mut map = vec![CellType::Fluid; (bsize.x * bsize.y) as usize];
    for x in 0..bsize.x {
        map[x as usize] = CellType::Obstacle;
        map[((bsize.y - 1) * bsize.x + x) as usize] = CellType::Inflow;
    }
    for y in 0..bsize.y {
        map[(y * bsize.x) as usize] = CellType::Obstacle;
        map[(y * bsize.x + bsize.x - 1) as usize] = CellType::Obstacle;
    }
    // Lid corners stay obstacles.
    map[((bsize.y - 1) * bsize.x) as usize] = CellType::Obstacle;
    map[(bsize.y * bsize.x - 1) as usize] = CellType::Obstacle;
    map
}

fn parse_value<T: std::str::FromStr>(token: Option<&str>, key: &str) -> Result<T, SimError> {
    token
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| SimError::InvalidConfig(format!("malformed value for '{}'", key)))
}

fn parse_tag(token: Option<&str>, key: &str) -> Result<u8, SimError> {
    match token {
        Some(t) if t.len() == 1 => Ok(t.as_bytes()[0]),
        _ => Err(SimError::InvalidConfig(format!(
            "malformed condition tag for '{}'",
            key
        ))),
    }
}
