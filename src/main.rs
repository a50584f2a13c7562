use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use copa::config::{CONFIG_FILE_NAME, Config};
use copa::stencil::magic::{
    HOT_COLD_BARRIER_SIZE, hot_cold_barrier_att_asm, hot_cold_barrier_offsets,
};
use copa::stencil::{AsmRewriteReport, StencilLoweringPass};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum ReportFormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "copa")]
#[command(about = "Copy-and-patch stencil tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split an LLVM-generated assembly function into fast and slow path sections
    Lower {
        /// The assembly file
        file: PathBuf,

        /// Function name used in diagnostics (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,

        /// Symbol of the dispatch to the next bytecode
        #[arg(long)]
        placeholder: Option<String>,

        /// Configuration file (defaults to ./copa.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print a report of the rewrite to stderr
        #[arg(long, value_enum, require_equals = true, num_args = 0..=1, default_missing_value = "human")]
        report: Option<ReportFormatArg>,
    },
    /// Split assembled machine code at the hot/cold barrier
    Split {
        /// The machine code blob
        file: PathBuf,

        /// Where to write the code before the barrier
        #[arg(long)]
        fast: PathBuf,

        /// Where to write the code after the barrier
        #[arg(long)]
        slow: PathBuf,
    },
    /// Print the hot/cold barrier in AT&T syntax
    Barrier,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Lower {
            file,
            name,
            placeholder,
            config,
            output,
            report,
        } => lower(&file, name, placeholder, config.as_deref(), output.as_deref(), report),
        Commands::Split { file, fast, slow } => split(&file, &fast, &slow),
        Commands::Barrier => {
            print!("{}", hot_cold_barrier_att_asm());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => Config::from_file(path).map_err(|e| e.to_string()),
        None => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            if cwd.join(CONFIG_FILE_NAME).exists() {
                Config::load(&cwd).map_err(|e| e.to_string())
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn lower(
    file: &Path,
    name: Option<String>,
    placeholder: Option<String>,
    config_path: Option<&Path>,
    output: Option<&Path>,
    report: Option<ReportFormatArg>,
) -> Result<(), String> {
    let mut config = load_config(config_path)?;
    if placeholder.is_some() {
        config.lowering.fallthrough_placeholder = placeholder;
    }
    let name = name.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    });

    let asm = fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
    let pass = StencilLoweringPass::for_asm(&config.lowering);
    let out = pass
        .run_asm_rewrite_phase(&asm, &name)
        .map_err(|e| format!("{}: {}", file.display(), e))?;

    match output {
        Some(path) => fs::write(path, &out.asm)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))?,
        None => print!("{}", out.asm),
    }

    match report {
        Some(ReportFormatArg::Human) => print_report(&out.report),
        Some(ReportFormatArg::Json) => {
            let json = serde_json::to_string_pretty(&out.report)
                .map_err(|e| format!("failed to serialize report: {}", e))?;
            eprintln!("{}", json);
        }
        None => {}
    }
    Ok(())
}

fn print_report(report: &AsmRewriteReport) {
    eprintln!("function:    {}", report.function);
    eprintln!("fast path:   {} lines", report.fast_path_lines);
    eprintln!(
        "slow path:   {} lines{}",
        report.slow_path_lines,
        if report.slow_path.synthesized_jump { " (synthesized jump)" } else { "" }
    );
    eprintln!("fallthrough: {:?}", report.fallthrough);
}

fn split(file: &Path, fast: &Path, slow: &Path) -> Result<(), String> {
    let code = fs::read(file).map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
    let offset = match hot_cold_barrier_offsets(&code).as_slice() {
        [offset] => *offset,
        [] => return Err(format!("{}: hot/cold barrier not found", file.display())),
        offsets => {
            return Err(format!(
                "{}: hot/cold barrier found {} times",
                file.display(),
                offsets.len()
            ));
        }
    };
    fs::write(fast, &code[..offset])
        .map_err(|e| format!("failed to write {}: {}", fast.display(), e))?;
    fs::write(slow, &code[offset + HOT_COLD_BARRIER_SIZE..])
        .map_err(|e| format!("failed to write {}: {}", slow.display(), e))?;
    Ok(())
}
