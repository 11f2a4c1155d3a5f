use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use posegraph::{
    G2oLoader, LinearSolverType, LoaderOptions, OptimizerConfig, OptimizerType, PoseGraphError,
    init_logger, optimize,
};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OptimizerArg {
    /// Gauss-Newton
    Gn,
    /// Levenberg-Marquardt
    Lm,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LinearSolverArg {
    Cholesky,
    Qr,
}

#[derive(Parser)]
#[command(name = "optimize_pose_graph")]
#[command(about = "Optimize 2D and 3D pose graphs from g2o files")]
struct Args {
    /// g2o file to load
    #[arg(short, long)]
    dataset: PathBuf,

    /// Optimizer algorithm
    #[arg(short, long, value_enum, default_value = "lm")]
    optimizer: OptimizerArg,

    /// Sparse linear solver
    #[arg(long, value_enum, default_value = "cholesky")]
    linear_solver: LinearSolverArg,

    /// Maximum number of optimization iterations
    #[arg(short, long, default_value = "100")]
    max_iterations: usize,

    /// Relative error decrease tolerance for convergence
    #[arg(long, default_value = "1e-5")]
    relative_tol: f64,

    /// Log optimizer start and summary
    #[arg(short, long)]
    verbose: bool,

    /// Optional path to save the optimized graph (e.g., output/optimized.g2o)
    #[arg(long)]
    save_output: Option<PathBuf>,
}

fn run(args: &Args) -> Result<(), PoseGraphError> {
    let load_start = Instant::now();
    let g2o = G2oLoader::load(&args.dataset)?;
    info!(
        "Loaded {} in {:.2}ms: {}",
        args.dataset.display(),
        load_start.elapsed().as_secs_f64() * 1000.0,
        g2o
    );
    if g2o.vertex_count() == 0 {
        warn!("No supported vertices found, nothing to optimize");
        return Ok(());
    }

    let (graph, initial_values) = g2o.into_problem(&LoaderOptions::default())?;
    info!("{}", graph.statistics(&initial_values));

    let config = OptimizerConfig::new()
        .with_optimizer_type(match args.optimizer {
            OptimizerArg::Gn => OptimizerType::GaussNewton,
            OptimizerArg::Lm => OptimizerType::LevenbergMarquardt,
        })
        .with_linear_solver_type(match args.linear_solver {
            LinearSolverArg::Cholesky => LinearSolverType::SparseCholesky,
            LinearSolverArg::Qr => LinearSolverType::SparseQR,
        })
        .with_max_iterations(args.max_iterations)
        .with_relative_error_tol(args.relative_tol)
        .with_verbose(args.verbose);

    info!(
        "Optimizing with {} ({})",
        config.optimizer_type, config.linear_solver_type
    );
    let (values, diagnostics) = optimize(&graph, initial_values, &config)?;

    info!("Status: {}", diagnostics.status);
    info!(
        "Error: {:.6e} -> {:.6e} in {} iterations ({:.2}ms)",
        diagnostics.initial_error,
        diagnostics.final_error,
        diagnostics.iterations,
        diagnostics.elapsed.as_secs_f64() * 1000.0
    );
    if !diagnostics.status.is_converged() {
        warn!("Optimization stopped before convergence");
    }

    if let Some(path) = &args.save_output {
        G2oLoader::write(&graph, &values, path)?;
        info!("Saved optimized graph to {}", path.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logger();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
