//! Traversal over the linear cell index.
//!
//! Every iterator walks a single 32-bit row-major index; a position
//! decomposes as `(value % xmax, value / xmax)`. Neighbor lookups clamp at
//! the domain edge and return the same cell instead of failing, so stencil
//! code can use them unconditionally; the outermost cells are ghosts
//! anyway.

use crate::geometry::CellType;
use crate::{Index, MultiIndex};

/// Position access shared by all iterator variants. Neighbor methods
/// produce a plain [`CellIterator`] so they can be chained
/// (`it.top().right()`).
pub trait GridIter {
    /// The current linear index.
    fn value(&self) -> Index;

    /// Grid size in cells (including the ghost ring).
    fn size(&self) -> MultiIndex;

    /// The current position per dimension.
    fn pos(&self) -> MultiIndex {
        let s = self.size();
        MultiIndex::new(self.value() % s.x, self.value() / s.x)
    }

    /// The cell to the left, or this cell at the left edge.
    fn left(&self) -> CellIterator {
        let v = self.value();
        let s = self.size();
        CellIterator::at(if v % s.x == 0 { v } else { v - 1 }, s)
    }

    /// The cell to the right, or this cell at the right edge.
    fn right(&self) -> CellIterator {
        let v = self.value();
        let s = self.size();
        CellIterator::at(if (v + 1) % s.x == 0 { v } else { v + 1 }, s)
    }

    /// The cell above, or this cell at the top edge.
    fn top(&self) -> CellIterator {
        let v = self.value();
        let s = self.size();
        let up = v + s.x;
        CellIterator::at(if up / s.x >= s.y { v } else { up }, s)
    }

    /// The cell below, or this cell at the bottom edge.
    fn down(&self) -> CellIterator {
        let v = self.value();
        let s = self.size();
        CellIterator::at(if v < s.x { v } else { v - s.x }, s)
    }
}

/// Iterates every cell of the grid, ghost ring included.
#[derive(Clone, Copy, Debug)]
pub struct CellIterator {
    value: Index,
    size: MultiIndex,
    itmin: Index,
    itmax: Index,
    valid: bool,
}

impl CellIterator {
    /// A full-grid iterator positioned on the first cell.
    pub fn new(size: MultiIndex) -> Self {
        Self::at(0, size)
    }

    /// A full-grid iterator positioned on `value`.
    pub fn at(value: Index, size: MultiIndex) -> Self {
        let mut it = CellIterator {
            value,
            size,
            itmin: 0,
            itmax: size.x * size.y - 1,
            valid: false,
        };
        it.update_valid();
        it
    }

    pub fn first(&mut self) {
        self.value = self.itmin;
        self.update_valid();
    }

    pub fn next(&mut self) {
        self.value += 1;
        self.update_valid();
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    fn update_valid(&mut self) {
        self.valid = self.value >= self.itmin && self.value <= self.itmax;
    }
}

impl GridIter for CellIterator {
    fn value(&self) -> Index {
        self.value
    }

    fn size(&self) -> MultiIndex {
        self.size
    }
}

/// Iterates the interior cells only, skipping the ghost ring.
#[derive(Clone, Copy, Debug)]
pub struct InteriorIterator {
    value: Index,
    size: MultiIndex,
    itmin: Index,
    itmax: Index,
    valid: bool,
}

impl InteriorIterator {
    pub fn new(size: MultiIndex) -> Self {
        let mut it = InteriorIterator {
            value: 0,
            size,
            itmin: size.x + 1,
            itmax: size.x * (size.y - 1) - 2,
            valid: false,
        };
        it.first();
        it
    }

    pub fn first(&mut self) {
        self.value = self.itmin;
        self.update_valid();
    }

    /// Advances by one cell; from the last interior column it jumps over
    /// the right and left ghost columns to the next row.
    pub fn next(&mut self) {
        self.value += 1;
        if (self.value + 1) % self.size.x == 0 {
            self.value += 2;
        }
        self.update_valid();
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    fn update_valid(&mut self) {
        self.valid = self.value >= self.itmin && self.value <= self.itmax;
    }
}

impl GridIter for InteriorIterator {
    fn value(&self) -> Index {
        self.value
    }

    fn size(&self) -> MultiIndex {
        self.size
    }
}

/// The four outer edges. The numbering is part of the scenario format and
/// fixes the order of the per-edge boundary descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Bottom = 1,
    Right = 2,
    Top = 3,
    Left = 4,
}

impl Edge {
    pub const ALL: [Edge; 4] = [Edge::Bottom, Edge::Right, Edge::Top, Edge::Left];

    /// Zero-based slot for per-edge descriptor arrays, in numbering order.
    pub fn slot(self) -> usize {
        self as usize - 1
    }

    pub fn is_horizontal(self) -> bool {
        matches!(self, Edge::Bottom | Edge::Top)
    }

    pub fn is_vertical(self) -> bool {
        !self.is_horizontal()
    }
}

/// Iterates one outer row or column of the grid.
#[derive(Clone, Copy, Debug)]
pub struct BoundaryIterator {
    value: Index,
    size: MultiIndex,
    itmin: Index,
    itmax: Index,
    edge: Edge,
    valid: bool,
}

impl BoundaryIterator {
    pub fn new(size: MultiIndex, edge: Edge) -> Self {
        let mut it = BoundaryIterator {
            value: 0,
            size,
            itmin: 0,
            itmax: 0,
            edge,
            valid: false,
        };
        it.set_edge(edge);
        it
    }

    /// Switches to another edge and rewinds.
    pub fn set_edge(&mut self, edge: Edge) {
        self.edge = edge;
        let s = self.size;
        let (itmin, itmax) = match edge {
            Edge::Bottom => (0, s.x - 1),
            Edge::Right => (s.x - 1, s.x * s.y - 1),
            Edge::Top => (s.x * (s.y - 1), s.x * s.y - 1),
            Edge::Left => (0, s.x * (s.y - 1)),
        };
        self.itmin = itmin;
        self.itmax = itmax;
        self.first();
    }

    pub fn edge(&self) -> Edge {
        self.edge
    }

    pub fn first(&mut self) {
        self.value = self.itmin;
        self.update_valid();
    }

    pub fn next(&mut self) {
        self.value += match self.edge {
            Edge::Bottom | Edge::Top => 1,
            Edge::Right | Edge::Left => self.size.x,
        };
        self.update_valid();
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    fn update_valid(&mut self) {
        self.valid = self.value >= self.itmin && self.value <= self.itmax;
    }

    pub fn corner_bottom_left(size: MultiIndex) -> CellIterator {
        CellIterator::at(0, size)
    }

    pub fn corner_bottom_right(size: MultiIndex) -> CellIterator {
        CellIterator::at(size.x - 1, size)
    }

    pub fn corner_top_left(size: MultiIndex) -> CellIterator {
        CellIterator::at(size.x * (size.y - 1), size)
    }

    pub fn corner_top_right(size: MultiIndex) -> CellIterator {
        CellIterator::at(size.x * size.y - 1, size)
    }
}

impl GridIter for BoundaryIterator {
    fn value(&self) -> Index {
        self.value
    }

    fn size(&self) -> MultiIndex {
        self.size
    }
}

/// Interior iterator restricted to cells whose type is not Fluid.
#[derive(Clone, Copy, Debug)]
pub struct ObstacleIterator<'a> {
    inner: InteriorIterator,
    cells: &'a [CellType],
}

impl<'a> ObstacleIterator<'a> {
    pub fn new(size: MultiIndex, cells: &'a [CellType]) -> Self {
        let mut it = ObstacleIterator {
            inner: InteriorIterator::new(size),
            cells,
        };
        it.skip_fluid();
        it
    }

    pub fn first(&mut self) {
        self.inner.first();
        self.skip_fluid();
    }

    pub fn next(&mut self) {
        self.inner.next();
        self.skip_fluid();
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn skip_fluid(&mut self) {
        while self.inner.valid() && self.cells[self.inner.value() as usize] == CellType::Fluid {
            self.inner.next();
        }
    }
}

impl GridIter for ObstacleIterator<'_> {
    fn value(&self) -> Index {
        self.inner.value()
    }

    fn size(&self) -> MultiIndex {
        self.inner.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngExt;

    const SIZE: MultiIndex = MultiIndex::new(6, 5);

    #[test]
    fn full_iterator_covers_every_cell() {
        let mut it = CellIterator::new(SIZE);
        let mut count = 0;
        while it.valid() {
            count += 1;
            it.next();
        }
        assert_eq!(count, 30);
    }

    #[test]
    fn interior_iterator_skips_ghost_ring() {
        let mut it = InteriorIterator::new(SIZE);
        let mut visited = Vec::new();
        while it.valid() {
            visited.push(it.pos());
            it.next();
        }
        assert_eq!(visited.len(), 4 * 3);
        for p in &visited {
            assert!(p.x >= 1 && p.x <= SIZE.x - 2, "ghost column {:?}", p);
            assert!(p.y >= 1 && p.y <= SIZE.y - 2, "ghost row {:?}", p);
        }
        // Row hop: from (4, 1) directly to (1, 2).
        assert_eq!(visited[3], MultiIndex::new(4, 1));
        assert_eq!(visited[4], MultiIndex::new(1, 2));
    }

    #[test]
    fn boundary_iterator_edges() {
        let runs = [
            (Edge::Bottom, 0, SIZE.x - 1, 6),
            (Edge::Right, SIZE.x - 1, SIZE.x * SIZE.y - 1, 5),
            (Edge::Top, SIZE.x * (SIZE.y - 1), SIZE.x * SIZE.y - 1, 6),
            (Edge::Left, 0, SIZE.x * (SIZE.y - 1), 5),
        ];
        for (edge, first, last, count) in runs {
            let mut it = BoundaryIterator::new(SIZE, edge);
            assert_eq!(it.value(), first);
            let mut n = 0;
            let mut v = 0;
            while it.valid() {
                v = it.value();
                n += 1;
                it.next();
            }
            assert_eq!(v, last, "last cell on {:?}", edge);
            assert_eq!(n, count, "cell count on {:?}", edge);
        }
    }

    #[test]
    fn corners() {
        assert_eq!(BoundaryIterator::corner_bottom_left(SIZE).pos(), MultiIndex::new(0, 0));
        assert_eq!(
            BoundaryIterator::corner_bottom_right(SIZE).pos(),
            MultiIndex::new(SIZE.x - 1, 0)
        );
        assert_eq!(
            BoundaryIterator::corner_top_left(SIZE).pos(),
            MultiIndex::new(0, SIZE.y - 1)
        );
        assert_eq!(
            BoundaryIterator::corner_top_right(SIZE).pos(),
            MultiIndex::new(SIZE.x - 1, SIZE.y - 1)
        );
    }

    #[test]
    fn neighbors_clamp_at_edges() {
        let bl = CellIterator::at(0, SIZE);
        assert_eq!(bl.left().value(), 0);
        assert_eq!(bl.down().value(), 0);
        assert_eq!(bl.right().value(), 1);
        assert_eq!(bl.top().value(), SIZE.x);

        let tr = CellIterator::at(SIZE.x * SIZE.y - 1, SIZE);
        assert_eq!(tr.right().value(), tr.value());
        assert_eq!(tr.top().value(), tr.value());
    }

    #[test]
    fn clamp_is_idempotent_on_the_interior() {
        let mut rng = rand::rng();
        for _ in 0..64 {
            let x = rng.random_range(1..SIZE.x - 1);
            let y = rng.random_range(1..SIZE.y - 1);
            let it = CellIterator::at(y * SIZE.x + x, SIZE);
            assert_eq!(it.left().right().value(), it.value());
            assert_eq!(it.right().left().value(), it.value());
            assert_eq!(it.top().down().value(), it.value());
            assert_eq!(it.down().top().value(), it.value());
        }
    }

    #[test]
    fn obstacle_iterator_filters_fluid() {
        let mut cells = vec![CellType::Obstacle; (SIZE.x * SIZE.y) as usize];
        for y in 1..SIZE.y - 1 {
            for x in 1..SIZE.x - 1 {
                cells[(y * SIZE.x + x) as usize] = CellType::Fluid;
            }
        }
        // Two interior obstacle cells.
        cells[(2 * SIZE.x + 2) as usize] = CellType::Obstacle;
        cells[(3 * SIZE.x + 4) as usize] = CellType::Obstacle;

        let mut it = ObstacleIterator::new(SIZE, &cells);
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(it.value());
            it.next();
        }
        assert_eq!(seen, vec![2 * SIZE.x + 2, 3 * SIZE.x + 4]);
    }

    #[test]
    fn obstacle_iterator_on_all_fluid_interior_is_done() {
        let mut cells = vec![CellType::Obstacle; (SIZE.x * SIZE.y) as usize];
        for y in 1..SIZE.y - 1 {
            for x in 1..SIZE.x - 1 {
                cells[(y * SIZE.x + x) as usize] = CellType::Fluid;
            }
        }
        let it = ObstacleIterator::new(SIZE, &cells);
        assert!(!it.valid());
    }
}
