//! Owned scalar field on the staggered grid.
//!
//! A grid is one flat row-major buffer of `Sx * Sy` values plus the
//! staggering offset that anchors it in physical space. All discrete
//! operators read the current cell and up to eight 4-connected neighbors
//! through the clamping iterators, so they are total: no operator fails on
//! a boundary cell.

use crate::geometry::Geometry;
use crate::iterator::{CellIterator, GridIter};
use crate::{Index, MultiIndex, MultiReal, Real};

/// Weight of one corner of the unit square for bilinear interpolation.
/// Corner 1 is lower-left, 2 lower-right, 3 upper-left, 4 upper-right.
fn hat(mode: u8, pos: MultiReal) -> Real {
    match mode {
        1 => pos.x * pos.y - pos.x - pos.y + 1.0,
        2 => -pos.x * pos.y + pos.x,
        3 => -pos.x * pos.y + pos.y,
        4 => pos.x * pos.y,
        _ => 0.0,
    }
}

pub struct Grid {
    /// Cells per dimension, ghost ring included.
    size: MultiIndex,
    /// Physical extent of the subdomain.
    length: MultiReal,
    /// Mesh width per dimension.
    h: MultiReal,
    /// Inverse mesh width, kept as a shorthand for the stencils.
    invh: MultiReal,
    /// Distance of the staggered sample point from the cell anchor
    /// (anchor = lower-left corner).
    offset: MultiReal,
    data: Vec<Real>,
}

impl Grid {
    /// A zero-initialized grid with no staggering offset.
    pub fn new(geom: &Geometry) -> Self {
        Self::with_offset(geom, MultiReal::new(0.0, 0.0))
    }

    /// A zero-initialized grid with the given staggering offset.
    pub fn with_offset(geom: &Geometry, offset: MultiReal) -> Self {
        let size = geom.size();
        Grid {
            size,
            length: geom.length(),
            h: geom.mesh(),
            invh: geom.inv_mesh(),
            offset,
            data: vec![0.0; (size.x * size.y) as usize],
        }
    }

    pub fn size(&self) -> MultiIndex {
        self.size
    }

    pub fn offset(&self) -> MultiReal {
        self.offset
    }

    pub fn mesh(&self) -> MultiReal {
        self.h
    }

    pub fn data(&self) -> &[Real] {
        &self.data
    }

    /// Sets every cell to `value`.
    pub fn initialize(&mut self, value: Real) {
        self.data.fill(value);
    }

    /// Sets cells whose sample point lies inside the circle to `value`,
    /// in physical coordinates of this subdomain.
    pub fn init_circle(&mut self, center: MultiReal, radius: Real, value: Real) {
        let mut it = CellIterator::new(self.size);
        while it.valid() {
            let p = self.sample_position(&it);
            let dx = p.x - center.x;
            let dy = p.y - center.y;
            if (dx * dx + dy * dy).sqrt() <= radius {
                *self.cell_mut(&it) = value;
            }
            it.next();
        }
    }

    /// Sets cells whose sample point lies inside the axis-aligned box
    /// `[lo, hi]` to `value`.
    pub fn init_square(&mut self, lo: MultiReal, hi: MultiReal, value: Real) {
        let mut it = CellIterator::new(self.size);
        while it.valid() {
            let p = self.sample_position(&it);
            if p.x >= lo.x && p.x <= hi.x && p.y >= lo.y && p.y <= hi.y {
                *self.cell_mut(&it) = value;
            }
            it.next();
        }
    }

    /// Physical position of a cell's staggered sample point.
    fn sample_position(&self, it: &impl GridIter) -> MultiReal {
        let p = it.pos();
        MultiReal::new(
            p.x as Real * self.h.x + self.offset.x,
            p.y as Real * self.h.y + self.offset.y,
        )
    }

    /// Full-grid iterator for this grid's size.
    pub fn iter(&self) -> CellIterator {
        CellIterator::new(self.size)
    }

    /// Read access at an iterator position.
    pub fn cell(&self, it: &impl GridIter) -> Real {
        self.data[it.value() as usize]
    }

    /// Write access at an iterator position.
    pub fn cell_mut(&mut self, it: &impl GridIter) -> &mut Real {
        &mut self.data[it.value() as usize]
    }

    /// Read access at a raw linear index.
    pub fn cell_at(&self, idx: Index) -> Real {
        self.data[idx as usize]
    }

    /// Write access at a raw linear index.
    pub fn cell_at_mut(&mut self, idx: Index) -> &mut Real {
        &mut self.data[idx as usize]
    }

    /// Bilinear interpolation at an arbitrary physical position.
    ///
    /// The position is clamped to the domain, shifted by the staggering
    /// offset, and the containing cell located; the four surrounding
    /// samples are blended with the hat weights of the unit square.
    pub fn interpolate(&self, pos: MultiReal) -> Real {
        let inner = MultiReal::new(
            pos.x.clamp(0.0, self.length.x) - self.offset.x,
            pos.y.clamp(0.0, self.length.y) - self.offset.y,
        );

        // Containing cell, clamped so the upper-right corner stays in range.
        let cx = ((inner.x * self.invh.x).floor() as i64).clamp(0, self.size.x as i64 - 2) as Index;
        let cy = ((inner.y * self.invh.y).floor() as i64).clamp(0, self.size.y as i64 - 2) as Index;

        // Position within the unit square spanned by the four samples.
        let modpos = MultiReal::new(
            inner.x * self.invh.x - cx as Real,
            inner.y * self.invh.y - cy as Real,
        );

        let it = CellIterator::at(cy * self.size.x + cx, self.size);
        self.cell(&it) * hat(1, modpos)
            + self.cell(&it.right()) * hat(2, modpos)
            + self.cell(&it.top()) * hat(3, modpos)
            + self.cell(&it.top().right()) * hat(4, modpos)
    }

    /// Left-sided difference quotient in x at `it`.
    pub fn dx_l(&self, it: &impl GridIter) -> Real {
        (self.cell(it) - self.cell(&it.left())) * self.invh.x
    }

    /// Right-sided difference quotient in x at `it`.
    pub fn dx_r(&self, it: &impl GridIter) -> Real {
        (self.cell(&it.right()) - self.cell(it)) * self.invh.x
    }

    /// Left-sided difference quotient in y at `it`.
    pub fn dy_l(&self, it: &impl GridIter) -> Real {
        (self.cell(it) - self.cell(&it.down())) * self.invh.y
    }

    /// Right-sided difference quotient in y at `it`.
    pub fn dy_r(&self, it: &impl GridIter) -> Real {
        (self.cell(&it.top()) - self.cell(it)) * self.invh.y
    }

    /// Central second-order difference quotient in x at `it`.
    pub fn dxx(&self, it: &impl GridIter) -> Real {
        (self.cell(&it.right()) + self.cell(&it.left()) - 2.0 * self.cell(it))
            * self.invh.x
            * self.invh.x
    }

    /// Central second-order difference quotient in y at `it`.
    pub fn dyy(&self, it: &impl GridIter) -> Real {
        (self.cell(&it.top()) + self.cell(&it.down()) - 2.0 * self.cell(it))
            * self.invh.y
            * self.invh.y
    }

    /// Donor-cell u*du/dx at `it`; `alpha` blends central and upwind.
    /// `self` is assumed to be u.
    pub fn dc_udu_x(&self, it: &impl GridIter, alpha: Real) -> Real {
        let c = self.cell(it);
        let l = self.cell(&it.left());
        let r = self.cell(&it.right());
        let ft = (c + r) * (c + r) - (l + c) * (l + c);
        let st = (c + r).abs() * (c - r) - (l + c).abs() * (l - c);
        0.25 * (ft + alpha * st) * self.invh.x
    }

    /// Donor-cell v*du/dy at `it`; `self` is assumed u, `v` the companion
    /// velocity grid.
    pub fn dc_vdu_y(&self, it: &impl GridIter, alpha: Real, v: &Grid) -> Real {
        let c = self.cell(it);
        let t = self.cell(&it.top());
        let d = self.cell(&it.down());
        let v_c = v.cell(it);
        let v_r = v.cell(&it.right());
        let v_d = v.cell(&it.down());
        let v_rd = v.cell(&it.right().down());
        let ft = (v_c + v_r) * (c + t) - (v_d + v_rd) * (d + c);
        let st = (v_c + v_r).abs() * (c - t) - (v_d + v_rd).abs() * (d - c);
        0.25 * (ft + alpha * st) * self.invh.y
    }

    /// Donor-cell u*dv/dx at `it`; `self` is assumed v, `u` the companion
    /// velocity grid.
    pub fn dc_udv_x(&self, it: &impl GridIter, alpha: Real, u: &Grid) -> Real {
        let c = self.cell(it);
        let l = self.cell(&it.left());
        let r = self.cell(&it.right());
        let u_c = u.cell(it);
        let u_t = u.cell(&it.top());
        let u_l = u.cell(&it.left());
        let u_lt = u.cell(&it.left().top());
        let ft = (c + r) * (u_c + u_t) - (l + c) * (u_l + u_lt);
        let st = (u_c + u_t).abs() * (c - r) - (u_l + u_lt).abs() * (l - c);
        0.25 * (ft + alpha * st) * self.invh.x
    }

    /// Donor-cell v*dv/dy at `it`; `self` is assumed to be v.
    pub fn dc_vdv_y(&self, it: &impl GridIter, alpha: Real) -> Real {
        let c = self.cell(it);
        let d = self.cell(&it.down());
        let t = self.cell(&it.top());
        let ft = (c + t) * (c + t) - (d + c) * (d + c);
        let st = (c + t).abs() * (c - t) - (d + c).abs() * (d - c);
        0.25 * (ft + alpha * st) * self.invh.y
    }

    /// Donor-cell d(Cu)/dx for scalar transport; `self` is the transported
    /// concentration, `u` the velocity, `gamma` the upwind weight.
    pub fn dc_dcu_x(&self, it: &impl GridIter, gamma: Real, u: &Grid) -> Real {
        let c = self.cell(it);
        let l = self.cell(&it.left());
        let r = self.cell(&it.right());
        let u_c = u.cell(it);
        let u_l = u.cell(&it.left());
        let ft = u_c * 0.5 * (r + c) - u_l * 0.5 * (c + l);
        let st = u_c.abs() * 0.5 * (c - r) - u_l.abs() * 0.5 * (l - c);
        (ft + gamma * st) * self.invh.x
    }

    /// Donor-cell d(Cv)/dy for scalar transport; `self` is the transported
    /// concentration, `v` the velocity, `gamma` the upwind weight.
    pub fn dc_dcv_y(&self, it: &impl GridIter, gamma: Real, v: &Grid) -> Real {
        let c = self.cell(it);
        let d = self.cell(&it.down());
        let t = self.cell(&it.top());
        let v_c = v.cell(it);
        let v_d = v.cell(&it.down());
        let ft = v_c * 0.5 * (t + c) - v_d * 0.5 * (c + d);
        let st = v_c.abs() * 0.5 * (c - t) - v_d.abs() * 0.5 * (d - c);
        (ft + gamma * st) * self.invh.y
    }

    /// Largest value in the buffer.
    pub fn max(&self) -> Real {
        self.data.iter().copied().fold(self.data[0], Real::max)
    }

    /// Smallest value in the buffer.
    pub fn min(&self) -> Real {
        self.data.iter().copied().fold(self.data[0], Real::min)
    }

    /// Largest absolute value in the buffer.
    pub fn abs_max(&self) -> Real {
        self.data.iter().fold(0.0, |m, v| Real::max(m, v.abs()))
    }

    /// The outermost left column (`offset = false`) or the first interior
    /// column (`offset = true`), bottom to top. Each call returns its own
    /// buffer.
    pub fn get_left_boundary(&self, offset: bool) -> Vec<Real> {
        self.column(if offset { 1 } else { 0 })
    }

    /// The outermost right column or the last interior column.
    pub fn get_right_boundary(&self, offset: bool) -> Vec<Real> {
        self.column(self.size.x - 1 - offset as Index)
    }

    /// The outermost top row or the last interior row.
    pub fn get_top_boundary(&self, offset: bool) -> Vec<Real> {
        self.row(self.size.y - 1 - offset as Index)
    }

    /// The outermost bottom row or the first interior row.
    pub fn get_bottom_boundary(&self, offset: bool) -> Vec<Real> {
        self.row(if offset { 1 } else { 0 })
    }

    /// Overwrites the outermost left column.
    pub fn write_left_boundary(&mut self, data: &[Real]) {
        self.write_column(0, data);
    }

    /// Overwrites the outermost right column.
    pub fn write_right_boundary(&mut self, data: &[Real]) {
        self.write_column(self.size.x - 1, data);
    }

    /// Overwrites the outermost top row.
    pub fn write_top_boundary(&mut self, data: &[Real]) {
        self.write_row(self.size.y - 1, data);
    }

    /// Overwrites the outermost bottom row.
    pub fn write_bottom_boundary(&mut self, data: &[Real]) {
        self.write_row(0, data);
    }

    fn column(&self, x: Index) -> Vec<Real> {
        (0..self.size.y)
            .map(|y| self.data[(y * self.size.x + x) as usize])
            .collect()
    }

    fn row(&self, y: Index) -> Vec<Real> {
        let start = (y * self.size.x) as usize;
        self.data[start..start + self.size.x as usize].to_vec()
    }

    fn write_column(&mut self, x: Index, data: &[Real]) {
        debug_assert_eq!(data.len(), self.size.y as usize);
        for (y, v) in data.iter().enumerate() {
            self.data[y * self.size.x as usize + x as usize] = *v;
        }
    }

    fn write_row(&mut self, y: Index, data: &[Real]) {
        debug_assert_eq!(data.len(), self.size.x as usize);
        let start = (y * self.size.x) as usize;
        self.data[start..start + self.size.x as usize].copy_from_slice(data);
    }

    /// Rows top to bottom, for diagnostics.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for y in (0..self.size.y).rev() {
            for x in 0..self.size.x {
                out.push_str(&format!("{:8.3}", self.data[(y * self.size.x + x) as usize]));
            }
            out.push('\n');
        }
        out
    }
}
