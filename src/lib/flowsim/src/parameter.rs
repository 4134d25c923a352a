//! Simulation constants.
//!
//! Defaults reproduce the classic driven-cavity setup; a parameter file
//! overrides individual values. Keys are matched case-insensitively and by
//! substring, so `omg` and `omega` both set the relaxation factor.

use std::path::Path;

use tracing::warn;

use crate::{Index, Real, SimError};

#[derive(Clone, Debug)]
pub struct Parameter {
    /// Reynolds number.
    pub re: Real,
    /// SOR relaxation factor, usable range (1, 2).
    pub omega: Real,
    /// Donor-cell weight for the velocity convection terms.
    pub alpha: Real,
    /// Default donor-cell weight for substance transport.
    pub gamma: Real,
    /// Upper bound for the dynamic time step.
    pub dt: Real,
    /// End of simulated time.
    pub tend: Real,
    /// Residual target of the pressure iteration.
    pub eps: Real,
    /// CFL safety factor in (0, 1]; a non-positive value disables dynamic
    /// stepping and runs with the fixed step `dt`.
    pub tau: Real,
    /// Iteration cap of the pressure solver.
    pub itermax: Index,
    /// Fixed output interval; non-positive disables the output cadence.
    pub fixed_dt: Real,
}

impl Parameter {
    /// Driven-cavity defaults.
    pub fn new() -> Self {
        Parameter {
            re: 1e3,
            omega: 1.7,
            alpha: 0.9,
            gamma: 0.5,
            dt: 0.1,
            tend: 10.0,
            eps: 1e-3,
            tau: 0.5,
            itermax: 100,
            fixed_dt: 0.0,
        }
    }

    /// Inverse Reynolds number, the diffusion coefficient of the momentum
    /// equation.
    pub fn inv_re(&self) -> Real {
        1.0 / self.re
    }

    /// Loads `key = value` lines from a parameter file. Unknown keys are
    /// reported and skipped.
    pub fn load(&mut self, path: &Path) -> Result<(), SimError> {
        let text = std::fs::read_to_string(path).map_err(|e| SimError::io(path, e))?;

        for line in text.lines() {
            let mut parts = line.splitn(2, '=');
            let key = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            let Some(raw) = parts.next() else {
                continue;
            };
            let value: Real = raw.trim().parse().map_err(|_| {
                SimError::InvalidConfig(format!("malformed value for parameter '{}'", key))
            })?;

            // Substring matching; the longer keys have to win over their
            // fragments (fixeddt over dt, itermax over iter).
            if key.contains("fixeddt") {
                self.fixed_dt = value;
            } else if key.contains("omg") || key.contains("omega") {
                self.omega = value;
            } else if key.contains("alpha") {
                self.alpha = value;
            } else if key.contains("gamma") {
                self.gamma = value;
            } else if key.contains("tend") {
                self.tend = value;
            } else if key.contains("iter") {
                self.itermax = value as Index;
            } else if key.contains("eps") {
                self.eps = value;
            } else if key.contains("tau") {
                self.tau = value;
            } else if key.contains("dt") {
                self.dt = value;
            } else if key == "re" {
                self.re = value;
            } else {
                warn!(key = key.as_str(), "ignoring unknown parameter");
            }
        }

        if self.re <= 0.0 {
            return Err(SimError::InvalidConfig(format!(
                "Reynolds number must be positive, got {}",
                self.re
            )));
        }
        if self.omega <= 0.0 || self.omega >= 2.0 {
            return Err(SimError::InvalidConfig(format!(
                "relaxation factor must lie in (0, 2), got {}",
                self.omega
            )));
        }
        Ok(())
    }
}

impl Default for Parameter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_cavity_setup() {
        let p = Parameter::new();
        assert_eq!(p.re, 1000.0);
        assert_eq!(p.omega, 1.7);
        assert_eq!(p.itermax, 100);
        assert!((p.inv_re() - 1e-3).abs() < 1e-18);
    }

    #[test]
    fn load_overrides_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "re = 100").unwrap();
        writeln!(file, "omg = 1.5").unwrap();
        writeln!(file, "alpha = 0.5").unwrap();
        writeln!(file, "dt = 0.05").unwrap();
        writeln!(file, "tend = 20").unwrap();
        writeln!(file, "itermax = 500").unwrap();
        writeln!(file, "eps = 0.0001").unwrap();
        writeln!(file, "tau = 0.4").unwrap();
        writeln!(file, "fixeddt = 0.2").unwrap();

        let mut p = Parameter::new();
        p.load(file.path()).unwrap();
        assert_eq!(p.re, 100.0);
        assert_eq!(p.omega, 1.5);
        assert_eq!(p.alpha, 0.5);
        assert_eq!(p.dt, 0.05);
        assert_eq!(p.tend, 20.0);
        assert_eq!(p.itermax, 500);
        assert_eq!(p.eps, 1e-4);
        assert_eq!(p.tau, 0.4);
        assert_eq!(p.fixed_dt, 0.2);
    }

    #[test]
    fn key_variants_and_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "OMEGA = 1.9").unwrap();
        writeln!(file, "Iter = 42").unwrap();
        writeln!(file, "wobble = 3").unwrap();

        let mut p = Parameter::new();
        p.load(file.path()).unwrap();
        assert_eq!(p.omega, 1.9);
        assert_eq!(p.itermax, 42);
        // Everything else untouched.
        assert_eq!(p.re, 1000.0);
    }

    #[test]
    fn unstable_relaxation_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "omega = 2.5").unwrap();

        let mut p = Parameter::new();
        assert!(matches!(
            p.load(file.path()),
            Err(SimError::InvalidConfig(_))
        ));
    }
}
