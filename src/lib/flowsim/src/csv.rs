//! CSV sampling of the velocity and pressure fields at fixed probe
//! positions, one record per emitted sample.
//!
//! Files append across runs so parameter sweeps accumulate into one
//! table; the header is written only when the file is created. The record
//! counter lives on the writer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::grid::Grid;
use crate::{MultiReal, Real, SimError};

pub struct CsvWriter {
    re: Real,
    /// Probe positions in physical coordinates.
    positions: Vec<MultiReal>,
    /// Running record id.
    count: u32,
    handle: Option<(PathBuf, File)>,
}

impl CsvWriter {
    pub fn new(re: Real, positions: Vec<MultiReal>) -> Self {
        CsvWriter {
            re,
            positions,
            count: 0,
            handle: None,
        }
    }

    /// Opens `<path>_<nn>.csv` in append mode, where `nn` is the probe
    /// count; writes the header if the file is new. A second call is a
    /// no-op.
    pub fn init(&mut self, path: &str) -> Result<(), SimError> {
        if self.handle.is_some() {
            return Ok(());
        }
        let base = if path.is_empty() { "multirun" } else { path };
        let filename = PathBuf::from(format!("{}_{:02}.csv", base, self.positions.len()));
        let existed = filename.exists();

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&filename)
            .map_err(|e| SimError::io(&filename, e))?;

        if !existed {
            let mut header = String::from("ID, RE, T");
            for i in 0..self.positions.len() {
                header.push_str(&format!(
                    ", X{0:02}, Y{0:02}, U{0:02}, V{0:02}, P{0:02}",
                    i
                ));
            }
            writeln!(file, "{}", header).map_err(|e| SimError::io(&filename, e))?;
        }

        self.handle = Some((filename, file));
        Ok(())
    }

    /// Appends one record: the probe positions with the interpolated
    /// velocities and pressure at time `t`.
    pub fn add_entry(&mut self, t: Real, u: &Grid, v: &Grid, p: &Grid) -> Result<(), SimError> {
        let Some((path, file)) = self.handle.as_mut() else {
            return Ok(());
        };

        let mut record = format!("{}, {:e}, {:e}", self.count, self.re, t);
        for pos in &self.positions {
            record.push_str(&format!(
                ", {:e}, {:e}, {:e}, {:e}, {:e}",
                pos.x,
                pos.y,
                u.interpolate(*pos),
                v.interpolate(*pos),
                p.interpolate(*pos)
            ));
        }
        writeln!(file, "{}", record).map_err(|e| SimError::io(path, e))?;

        self.count += 1;
        Ok(())
    }

    /// Closes the file; a later `init` reopens it.
    pub fn finish(&mut self) {
        self.handle = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    #[test]
    fn header_once_then_one_record_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("probe").display().to_string();

        let geom = Geometry::new();
        let mut u = Grid::new(&geom);
        let v = Grid::new(&geom);
        let p = Grid::new(&geom);
        u.initialize(0.5);

        let mut csv = CsvWriter::new(1000.0, vec![MultiReal::new(0.5, 0.5)]);
        csv.init(&base).unwrap();
        csv.add_entry(0.0, &u, &v, &p).unwrap();
        csv.add_entry(0.1, &u, &v, &p).unwrap();
        csv.finish();

        // Appending run: no second header.
        csv.init(&base).unwrap();
        csv.add_entry(0.2, &u, &v, &p).unwrap();
        csv.finish();

        let text = std::fs::read_to_string(format!("{}_01.csv", base)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("ID, RE, T, X00, Y00, U00, V00, P00"));
        assert!(lines[1].starts_with("0, "));
        assert!(lines[3].starts_with("2, "));
        // The interpolated u value shows up in the record.
        assert!(lines[1].contains("5e-1"));
    }
}
