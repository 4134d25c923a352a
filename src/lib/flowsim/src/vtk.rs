//! VTK output: one structured-grid `.vts` piece per rank and step, a
//! master-only `.pvts` index stitching the pieces together, and a
//! PolyData `.particles` container for streaklines and traces.
//!
//! Fields are sampled at the cell corners by bilinear interpolation, so
//! every piece covers its subdomain without the ghost ring.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::grid::Grid;
use crate::{Index, MultiIndex, MultiReal, Real, SimError};

pub struct VtkWriter {
    h: MultiReal,
    /// Per-rank size in cells, ghost ring included.
    size: MultiIndex,
    /// Physical origin of this rank's piece.
    origin: MultiReal,
    /// Step counter, part of every file name.
    count: u32,
    handle: Option<(PathBuf, BufWriter<File>)>,
}

impl VtkWriter {
    pub fn new(h: MultiReal, size: MultiIndex) -> Self {
        Self::with_origin(h, size, MultiReal::new(0.0, 0.0))
    }

    pub fn with_origin(h: MultiReal, size: MultiIndex, origin: MultiReal) -> Self {
        VtkWriter {
            h,
            size,
            origin,
            count: 0,
            handle: None,
        }
    }

    fn open(&self, filename: PathBuf) -> Result<(PathBuf, BufWriter<File>), SimError> {
        let file = File::create(&filename).map_err(|e| SimError::io(&filename, e))?;
        Ok((filename, BufWriter::new(file)))
    }

    fn write(&mut self, text: &str) -> Result<(), SimError> {
        let Some((path, file)) = self.handle.as_mut() else {
            return Ok(());
        };
        file.write_all(text.as_bytes())
            .map_err(|e| SimError::io(path, e))
    }

    /// Starts `<path>_<step>_<rank>.vts`: header, the point coordinates
    /// of this piece, and the opening of the point-data block.
    pub fn init(&mut self, path: &str, rank: usize) -> Result<(), SimError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let filename = PathBuf::from(format!("{}_{}_{}.vts", path, self.count, rank));
        self.handle = Some(self.open(filename)?);

        let nx = self.size.x - 2;
        let ny = self.size.y - 2;
        let mut text = String::new();
        text.push_str("<?xml version=\"1.0\"?>\n");
        text.push_str("<VTKFile type=\"StructuredGrid\">\n");
        text.push_str(&format!(
            "<StructuredGrid WholeExtent=\"0 {} 0 {} 0 0\">\n",
            nx, ny
        ));
        text.push_str(&format!("<Piece Extent=\"0 {} 0 {} 0 0\">\n", nx, ny));
        text.push_str("<Points>\n");
        text.push_str("<DataArray type=\"Float64\" format=\"ascii\" NumberOfComponents=\"3\">\n");
        for y in 0..=ny {
            for x in 0..=nx {
                text.push_str(&format!(
                    "{:e} {:e} 0\n",
                    x as Real * self.h.x + self.origin.x,
                    y as Real * self.h.y + self.origin.y
                ));
            }
        }
        text.push_str("</DataArray>\n</Points>\n<PointData>\n");
        self.write(&text)
    }

    /// Adds one interpolated scalar field to the open piece.
    pub fn add_scalar(&mut self, title: &str, grid: &Grid) -> Result<(), SimError> {
        if self.handle.is_none() {
            return Ok(());
        }
        let nx = self.size.x - 2;
        let ny = self.size.y - 2;
        let mut text = format!(
            "<DataArray Name=\"{}\" type=\"Float64\" format=\"ascii\">\n",
            title
        );
        for y in 0..=ny {
            for x in 0..=nx {
                let pos = MultiReal::new(x as Real * self.h.x, y as Real * self.h.y);
                text.push_str(&format!("{:e} ", grid.interpolate(pos)));
            }
            text.push('\n');
        }
        text.push_str("</DataArray>\n");
        self.write(&text)
    }

    /// Adds one interpolated vector field (third component zero).
    pub fn add_field(&mut self, title: &str, v1: &Grid, v2: &Grid) -> Result<(), SimError> {
        if self.handle.is_none() {
            return Ok(());
        }
        let nx = self.size.x - 2;
        let ny = self.size.y - 2;
        let mut text = format!(
            "<DataArray Name=\"{}\" type=\"Float64\" format=\"ascii\" NumberOfComponents=\"3\">\n",
            title
        );
        for y in 0..=ny {
            for x in 0..=nx {
                let pos = MultiReal::new(x as Real * self.h.x, y as Real * self.h.y);
                text.push_str(&format!(
                    "{:e} {:e} 0\n",
                    v1.interpolate(pos),
                    v2.interpolate(pos)
                ));
            }
        }
        text.push_str("</DataArray>\n");
        self.write(&text)
    }

    /// Closes the piece and advances the step counter.
    pub fn finish(&mut self) -> Result<(), SimError> {
        if self.handle.is_none() {
            return Ok(());
        }
        self.write("</PointData>\n</Piece>\n</StructuredGrid>\n</VTKFile>\n")?;
        self.handle = None;
        self.count += 1;
        Ok(())
    }

    /// Writes the master index `<path>_<step>.pvts` referencing every
    /// rank's piece by its extent. `whole` is the global interior size in
    /// cells, `fields` the scalar names, `vector_fields` the vector
    /// names.
    pub fn write_index(
        &mut self,
        path: &str,
        whole: MultiIndex,
        extents: &[[Index; 4]],
        vector_fields: &[&str],
        fields: &[&str],
    ) -> Result<(), SimError> {
        let filename = PathBuf::from(format!("{}_{}.pvts", path, self.count));
        let (pvts_path, mut file) = self.open(filename)?;

        let mut text = String::new();
        text.push_str("<?xml version=\"1.0\"?>\n");
        text.push_str("<VTKFile type=\"PStructuredGrid\">\n");
        text.push_str(&format!(
            "<PStructuredGrid WholeExtent=\"0 {} 0 {} 0 0\" GhostLevel=\"0\">\n",
            whole.x - 2,
            whole.y - 2
        ));
        text.push_str("<PPoints>\n");
        text.push_str("<PDataArray type=\"Float64\" NumberOfComponents=\"3\"/>\n");
        text.push_str("</PPoints>\n<PPointData>\n");
        for name in vector_fields {
            text.push_str(&format!(
                "<PDataArray Name=\"{}\" type=\"Float64\" NumberOfComponents=\"3\"/>\n",
                name
            ));
        }
        for name in fields {
            text.push_str(&format!(
                "<PDataArray Name=\"{}\" type=\"Float64\"/>\n",
                name
            ));
        }
        text.push_str("</PPointData>\n");

        let base = path.rsplit('/').next().unwrap_or(path);
        for (rank, e) in extents.iter().enumerate() {
            text.push_str(&format!(
                "<Piece Extent=\"{} {} {} {} 0 0\" Source=\"{}_{}_{}.vts\"/>\n",
                e[0], e[1], e[2], e[3], base, self.count, rank
            ));
        }
        text.push_str("</PStructuredGrid>\n</VTKFile>\n");

        file.write_all(text.as_bytes())
            .map_err(|e| SimError::io(&pvts_path, e))
    }

    /// Starts `<path>_<step>.particles`, a PolyData container.
    pub fn init_particles(&mut self, path: &str) -> Result<(), SimError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let filename = PathBuf::from(format!("{}_{}.particles", path, self.count));
        self.handle = Some(self.open(filename)?);
        self.write(
            "<?xml version=\"1.0\"?>\n\
             <VTKFile type=\"PolyData\" version=\"0.1\" byte_order=\"LittleEndian\">\n\
             <PolyData>\n",
        )
    }

    /// Adds one piece per particle line (streakline or trace).
    pub fn add_particles(&mut self, lines: &[Vec<MultiReal>]) -> Result<(), SimError> {
        if self.handle.is_none() {
            return Ok(());
        }
        let mut text = String::new();
        for line in lines {
            text.push_str(&format!(
                "<Piece NumberOfPoints=\"{}\" NumberOfVerts=\"0\" NumberOfLines=\"0\" \
                 NumberOfStrips=\"0\" NumberOfPolys=\"0\">\n",
                line.len()
            ));
            text.push_str("<Points>\n");
            text.push_str(
                "<DataArray type=\"Float64\" format=\"ascii\" NumberOfComponents=\"3\">\n",
            );
            for p in line {
                text.push_str(&format!("{:e} {:e} 0\n", p.x, p.y));
            }
            text.push_str("</DataArray>\n</Points>\n</Piece>\n");
        }
        self.write(&text)
    }

    /// Closes the particle container.
    pub fn finish_particles(&mut self) -> Result<(), SimError> {
        if self.handle.is_none() {
            return Ok(());
        }
        self.write("</PolyData>\n</VTKFile>\n")?;
        self.handle = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    #[test]
    fn piece_contains_points_and_fields() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("field").display().to_string();

        let geom = Geometry::new();
        let mut p = Grid::new(&geom);
        p.initialize(2.0);

        let mut vtk = VtkWriter::new(geom.mesh(), geom.size());
        vtk.init(&base, 0).unwrap();
        vtk.add_scalar("Pressure", &p).unwrap();
        vtk.add_field("Velocity", &p, &p).unwrap();
        vtk.finish().unwrap();

        let text = std::fs::read_to_string(format!("{}_0_0.vts", base)).unwrap();
        assert!(text.contains("WholeExtent=\"0 8 0 8 0 0\""));
        assert!(text.contains("Name=\"Pressure\""));
        assert!(text.contains("Name=\"Velocity\""));
        assert!(text.ends_with("</VTKFile>\n"));

        // 9 x 9 corner points.
        let points = text
            .split("<DataArray")
            .nth(1)
            .unwrap()
            .lines()
            .filter(|l| l.ends_with(" 0"))
            .count();
        assert_eq!(points, 81);
    }

    #[test]
    fn index_references_every_piece() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("field").display().to_string();

        let geom = Geometry::new();
        let mut vtk = VtkWriter::new(geom.mesh(), geom.size());
        vtk.write_index(
            &base,
            MultiIndex::new(10, 10),
            &[[0, 4, 0, 8], [4, 8, 0, 8]],
            &["Velocity"],
            &["Pressure"],
        )
        .unwrap();

        let text = std::fs::read_to_string(format!("{}_0.pvts", base)).unwrap();
        assert!(text.contains("Source=\"field_0_0.vts\""));
        assert!(text.contains("Source=\"field_0_1.vts\""));
        assert!(text.contains("Extent=\"4 8 0 8 0 0\""));
    }

    #[test]
    fn particle_container_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("streaks").display().to_string();

        let geom = Geometry::new();
        let mut vtk = VtkWriter::new(geom.mesh(), geom.size());
        vtk.init_particles(&base).unwrap();
        vtk.add_particles(&[vec![MultiReal::new(0.1, 0.2), MultiReal::new(0.3, 0.4)]])
            .unwrap();
        vtk.finish_particles().unwrap();

        let text = std::fs::read_to_string(format!("{}_0.particles", base)).unwrap();
        assert!(text.contains("NumberOfPoints=\"2\""));
        assert!(text.contains("PolyData"));
    }
}
