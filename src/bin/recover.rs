//! Command-line recovery driver.
//!
//! Reads a disassembled listing and a corruption descriptor, runs the probabilistic
//! recuperator and the forward-constraint enumerator, then writes the binary solution.
//! Exit codes: 0 when solved, 1 when the engine could not settle on a constrained
//! solution, 2 on input errors.

use calvados::{
    candidate::CandidateStore,
    corruption::CorruptionSpec,
    error::RecoverError,
    recuperator::{Recuperator, RecoveryConfig},
    reader::{InstructionSet, TextDisassembleReader},
    report::{ReportWriter, SolutionQuality},
    solution::SolutionWriter,
    solver::ForwardConstraintEnumerator,
};
use clap::Parser;
use log::{error, info};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "recover",
    about = "Recovers ARM instructions lost to packet erasure"
)]
struct Args {
    /// Disassembled text listing of the program image.
    disassembly: PathBuf,

    /// Corruption descriptor (JSON).
    corruption: PathBuf,

    /// Output path of the binary solution.
    #[arg(long)]
    out: PathBuf,

    /// Directory receiving diagnostic reports and solution dumps.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Bound on scoring passes; iterates until stable when absent.
    #[arg(long)]
    passes: Option<usize>,

    /// Cap on the number of complete assignments the enumerator counts.
    #[arg(long)]
    max_solutions: Option<usize>,

    /// JSON configuration file overriding the probabilistic model defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(solved) => {
            if solved {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<bool, RecoverError> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str::<RecoveryConfig>(&fs::read_to_string(path)?)?,
        None => RecoveryConfig::default(),
    };
    if let Some(passes) = args.passes {
        config.passes = Some(passes);
    }
    if let Some(max_solutions) = args.max_solutions {
        config.max_solutions = max_solutions;
    }

    let reader = TextDisassembleReader::new(InstructionSet::Arm);
    let program = reader.open(&args.disassembly)?;
    info!(
        "program read: {} instructions over {} functions",
        program.len(),
        program.functions().len()
    );

    let spec = CorruptionSpec::from_json(&fs::read_to_string(&args.corruption)?)?;
    let mut store = CandidateStore::from_program(&program);
    spec.apply(&program, &mut store, config.candidates_per_address)?;
    SolutionQuality::measure(&store, &program).report();

    if let Some(dir) = &args.report {
        fs::create_dir_all(dir)?;
        // Keep the corruption replayable and dump the baseline solution.
        let replay = serde_json::to_string_pretty(&CorruptionSpec::from_store(&store))?;
        fs::write(dir.join("corrupted.json"), replay)?;
        ReportWriter::new(&program).write_to_path(dir.join("corrupted_program.txt"), &store)?;
        SolutionWriter::new().write_binary_to_path(
            dir.join("initial_solution.sol"),
            &store,
            None,
        )?;
    }

    let recuperator = Recuperator::with_config(&program, config.clone());
    let convergence = recuperator.recover(&mut store);
    SolutionQuality::measure(&store, &program).report();

    let solution = ForwardConstraintEnumerator::new(&program)
        .max_solutions(config.max_solutions)
        .build(&mut store);
    info!(
        "constrained solution size: {} ({} passes, {})",
        solution.solution_size,
        convergence.passes(),
        if convergence.is_stable() {
            "stable"
        } else {
            "unstable"
        }
    );

    if let Some(dir) = &args.report {
        ReportWriter::new(&program).write_to_path(
            dir.join(format!("instructions{}.txt", convergence.passes())),
            &store,
        )?;
        SolutionWriter::new().write_binary_to_path(
            dir.join("final_solution.sol"),
            &store,
            Some(&solution.assignment),
        )?;
    }

    SolutionWriter::new().write_binary(
        &mut std::io::BufWriter::new(fs::File::create(&args.out)?),
        &store,
        Some(&solution.assignment),
    )?;

    Ok(convergence.is_stable() && solution.solution_size >= 1)
}
