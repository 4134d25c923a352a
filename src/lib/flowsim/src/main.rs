//! Command-line driver.
//!
//! `flowsim scenario <name>` loads `scenarios/<name>.param`,
//! `scenarios/<name>.geom` and, if present, `scenarios/<name>.subst`;
//! without a scenario the built-in driven cavity runs. `ranks <n>`
//! selects the number of subdomain ranks (1, 2 or 4). A `TEST_*`
//! argument runs the matching subsystem check and exits.

use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowsim::comm::Communicator;
use flowsim::compute::Compute;
use flowsim::csv::CsvWriter;
use flowsim::geometry::Geometry;
use flowsim::parameter::Parameter;
use flowsim::selftest;
use flowsim::solver::Solver;
use flowsim::substance::Substance;
use flowsim::vtk::VtkWriter;
use flowsim::{MultiReal, SimError};

struct Cli {
    scenario: Option<String>,
    ranks: usize,
    test: Option<String>,
}

fn parse_args() -> Result<Cli> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut cli = Cli {
        scenario: None,
        ranks: 1,
        test: None,
    };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "scenario" if i + 1 < args.len() => {
                cli.scenario = Some(args[i + 1].clone());
                i += 1;
            }
            "ranks" if i + 1 < args.len() => {
                cli.ranks = args[i + 1]
                    .parse()
                    .with_context(|| format!("invalid rank count '{}'", args[i + 1]))?;
                i += 1;
            }
            test if test.starts_with("TEST_") => cli.test = Some(test.to_string()),
            other => anyhow::bail!("unknown argument '{}'", other),
        }
        i += 1;
    }
    Ok(cli)
}

fn scenario_paths(name: &str) -> (PathBuf, PathBuf, PathBuf) {
    let base = PathBuf::from("scenarios");
    (
        base.join(format!("{}.param", name)),
        base.join(format!("{}.geom", name)),
        base.join(format!("{}.subst", name)),
    )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = parse_args()?;

    if let Some(test) = &cli.test {
        let mut param = Parameter::new();
        let mut geom = Geometry::new();
        if let Some(name) = &cli.scenario {
            let (param_path, geom_path, _) = scenario_paths(name);
            param.load(&param_path)?;
            geom.load(&geom_path)?;
        }
        selftest::run(test, &param, &geom)?;
        return Ok(());
    }

    let start = std::time::Instant::now();
    run(cli.scenario.as_deref(), cli.ranks)?;
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "run finished");
    Ok(())
}

fn run(scenario: Option<&str>, ranks: usize) -> Result<()> {
    let comms = Communicator::split(ranks)?;

    let results: Vec<Result<(), SimError>> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || run_rank(comm, scenario)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(SimError::Comm("a rank panicked".into())))
            })
            .collect()
    });

    // Report the first failure; the others are usually the echo of the
    // same condition through lost channels.
    for r in results {
        r?;
    }
    Ok(())
}

fn run_rank(comm: Communicator, scenario: Option<&str>) -> Result<(), SimError> {
    let mut param = Parameter::new();
    let mut geom = Geometry::new();
    let mut substance = None;

    if let Some(name) = scenario {
        let (param_path, geom_path, subst_path) = scenario_paths(name);
        param.load(&param_path)?;
        geom.load(&geom_path)?;
        geom.recalculate(&comm)?;
        if subst_path.exists() {
            substance = Some(Substance::load(&geom, &subst_path)?);
        }
    } else {
        geom.recalculate(&comm)?;
    }

    if comm.is_master() {
        info!(
            scenario = scenario.unwrap_or("driven cavity"),
            ranks = comm.size(),
            size = ?geom.total_size(),
            re = param.re,
            "starting"
        );
    }

    let solver = Solver::red_black(&geom, param.omega);
    let mut comp = Compute::new(&geom, &comm, solver, substance);

    std::fs::create_dir_all("VTK")
        .map_err(|e| SimError::io(std::path::Path::new("VTK"), e))?;

    let h = geom.mesh();
    let extent = geom.extent();
    let origin = MultiReal::new(extent[0] as f64 * h.x, extent[2] as f64 * h.y);
    let mut vtk = VtkWriter::with_origin(h, geom.size(), origin);

    let mut csv = if comm.is_master() {
        let mut writer = CsvWriter::new(param.re, geom.traces().to_vec());
        writer.init(scenario.unwrap_or(""))?;
        Some(writer)
    } else {
        None
    };

    let mut steps_since_output = 0u32;
    while comp.time() < param.tend {
        let report = comp.time_step(&geom, &param, &comm)?;
        steps_since_output += 1;

        // With a fixed output interval the step itself lands on the
        // output instants; otherwise sample every tenth step.
        let emit = report.print || (param.fixed_dt <= 0.0 && steps_since_output >= 10);
        if !emit {
            continue;
        }
        steps_since_output = 0;

        write_fields(&mut comp, &geom, &comm, &mut vtk)?;
        write_particles(&comp, &comm, &mut vtk)?;
        if let Some(csv) = csv.as_mut() {
            csv.add_entry(comp.time(), comp.u(), comp.v(), comp.p())?;
        }
        if comm.is_master() {
            info!(
                t = comp.time(),
                dt = report.dt,
                iterations = report.iterations,
                residual = report.residual,
                converged = report.converged,
                "sample written"
            );
        }
    }

    if let Some(csv) = csv.as_mut() {
        csv.finish();
    }
    Ok(())
}

fn write_fields(
    comp: &mut Compute,
    geom: &Geometry,
    comm: &Communicator,
    vtk: &mut VtkWriter,
) -> Result<(), SimError> {
    vtk.init("VTK/field", comm.rank())?;
    vtk.add_field("Velocity", comp.u(), comp.v())?;
    vtk.add_scalar("Pressure", comp.p())?;
    vtk.add_scalar("Stream", comp.stream_function())?;
    vtk.add_scalar("Vorticity", comp.vorticity())?;
    if let Some(substance) = comp.substance() {
        for i in 0..substance.n() as usize {
            vtk.add_scalar(&format!("Concentration{:02}", i), substance.species(i))?;
        }
    }

    if comm.is_master() {
        if let Some(extents) = geom.extents() {
            let mut scalars = vec!["Pressure", "Stream", "Vorticity"];
            let names: Vec<String> = comp
                .substance()
                .map(|s| (0..s.n() as usize).map(|i| format!("Concentration{:02}", i)).collect())
                .unwrap_or_default();
            scalars.extend(names.iter().map(|s| s.as_str()));
            vtk.write_index("VTK/field", geom.total_size(), extents, &["Velocity"], &scalars)?;
        }
    }
    vtk.finish()
}

fn write_particles(
    comp: &Compute,
    comm: &Communicator,
    vtk: &mut VtkWriter,
) -> Result<(), SimError> {
    // Particle state is advanced globally, so the master's copy is the
    // whole picture.
    if !comm.is_master() {
        return Ok(());
    }
    if !comp.streaklines().is_empty() {
        vtk.init_particles("VTK/streaks")?;
        vtk.add_particles(comp.streaklines())?;
        vtk.finish_particles()?;
    }
    if !comp.traces().is_empty() {
        vtk.init_particles("VTK/traces")?;
        vtk.add_particles(comp.traces())?;
        vtk.finish_particles()?;
    }
    Ok(())
}
