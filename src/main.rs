use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use serde::Serialize;

use anisoap_calc::core::chemistry;
use anisoap_calc::engine::calculator::Property;
use anisoap_calc::engine::config::{BackendKind, RunConfig};
use anisoap_calc::engine::descriptor::Precision;
use anisoap_calc::io::extxyz;

// --- CLI Definitions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Energies and forces for ellipsoidal particle frames", long_about = None)]
struct Args {
    /// Extended-XYZ file with one or more frames
    input: PathBuf,

    /// JSON run configuration (backend, descriptor, calculator knobs)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Linear-model artifact; overrides the configuration file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Descriptor backend; overrides the configuration file
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// Round tracked descriptor features to single precision
    #[arg(long)]
    single_precision: bool,

    /// Also compute forces
    #[arg(short, long)]
    forces: bool,

    /// Finite-difference step (Å); enables finite differences on the numeric backend
    #[arg(long)]
    step: Option<f64>,

    /// Spread finite-difference displacements over worker threads
    #[arg(long)]
    parallel: bool,

    /// Number of worker threads for parallel finite differences (0 = rayon default)
    #[arg(short, long, default_value_t = 0)]
    threads: usize,

    /// Disable the fingerprint cache
    #[arg(long)]
    no_cache: bool,

    #[arg(long, value_enum, default_value = "json")]
    format: OutputFormat,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Numeric,
    Differentiable,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Numeric => BackendKind::Numeric,
            Backend::Differentiable => BackendKind::Differentiable,
        }
    }
}

// --- Reports ---

#[derive(Debug, Serialize)]
struct FrameReport {
    frame: usize,
    n_particles: usize,
    energy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    forces: Option<Vec<[f64; 3]>>,
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    frame: usize,
    particle: usize,
    species: &'a str,
    energy: f64,
    fx: Option<f64>,
    fy: Option<f64>,
    fz: Option<f64>,
}

fn build_run_config(args: &Args) -> Result<RunConfig> {
    let mut run = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(model) = &args.model {
        run.model = Some(model.clone());
    }
    if let Some(backend) = args.backend {
        run.backend = backend.into();
    }
    if args.single_precision {
        run.precision = Precision::Single;
    }
    if let Some(step) = args.step {
        run.calculator.fd_step = step;
        run.calculator.finite_difference = true;
    }
    if args.parallel {
        run.calculator.parallel_fd = true;
    }
    if args.no_cache {
        run.calculator.cache = false;
    }
    // Forces on the numeric backend are only reachable through finite differences.
    if args.forces && run.backend == BackendKind::Numeric && !run.calculator.finite_difference {
        warn!("Numeric backend without finite differences; enabling them for --forces");
        run.calculator.finite_difference = true;
    }
    Ok(run)
}

fn write_csv<W: Write>(sink: W, frames: &[(FrameReport, Vec<u32>)]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(sink);
    for (report, species) in frames {
        for (i, z) in species.iter().enumerate() {
            let f = report.forces.as_ref().map(|f| f[i]);
            writer.serialize(CsvRow {
                frame: report.frame,
                particle: i,
                species: chemistry::symbol(*z).unwrap_or("X"),
                energy: report.energy,
                fx: f.map(|v| v[0]),
                fy: f.map(|v| v[1]),
                fz: f.map(|v| v[2]),
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

// --- Main ---

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
            .context("Failed to configure the worker pool")?;
    }

    let run = build_run_config(&args)?;
    let frames = extxyz::read_frames(&args.input)?;
    if frames.is_empty() {
        bail!("{} contains no frames", args.input.display());
    }
    info!(
        "Loaded {} frame(s) from {}; backend {:?}",
        frames.len(),
        args.input.display(),
        run.backend
    );

    let mut calc = run.build()?;
    let properties: &[Property] = if args.forces {
        &[Property::Energy, Property::Forces]
    } else {
        &[Property::Energy]
    };

    let start = Instant::now();
    let mut reports = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let results = calc
            .calculate(frame, properties)
            .with_context(|| format!("Evaluation of frame {} failed", index))?;
        let energy = results
            .energy
            .with_context(|| format!("No energy stored for frame {}", index))?;
        let forces = results
            .forces
            .as_ref()
            .map(|f| f.iter().map(|v| [v.x, v.y, v.z]).collect());
        reports.push((
            FrameReport {
                frame: index,
                n_particles: frame.len(),
                energy,
                forces,
            },
            frame.species.clone(),
        ));
    }
    info!(
        "Evaluated {} frame(s) in {:.3} s",
        reports.len(),
        start.elapsed().as_secs_f64()
    );

    let sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Could not create {}", path.display()))?,
        ),
        None => Box::new(io::stdout().lock()),
    };

    match args.format {
        OutputFormat::Json => {
            let body: Vec<&FrameReport> = reports.iter().map(|(r, _)| r).collect();
            let mut sink = sink;
            serde_json::to_writer_pretty(&mut sink, &body)?;
            writeln!(sink)?;
        }
        OutputFormat::Csv => write_csv(sink, &reports)?,
    }

    Ok(())
}
