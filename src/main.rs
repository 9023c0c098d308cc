use clap::{Parser, Subcommand};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use zeta::RuntimeConfig;
use zeta::vm::VM;

#[derive(Parser)]
#[command(name = "zeta")]
#[command(about = "A lazy basic-block versioning virtual machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an exported function of a program image
    Run {
        /// The program image (JSON) to run
        image: PathBuf,

        /// Export to call (defaults to zeta.toml entry_export, then "main")
        #[arg(long)]
        export: Option<String>,

        /// Code heap size in bytes
        #[arg(long)]
        code_heap_size: Option<usize>,

        /// Value stack size in slots
        #[arg(long)]
        stack_size: Option<usize>,

        /// Trace block compilation events
        #[arg(long)]
        trace_compile: bool,

        /// Print execution statistics to stderr
        #[arg(long)]
        stats: bool,

        /// Dump the compiled code to stderr after running
        #[arg(long)]
        dump_code: bool,
    },
    /// Compile every block reachable from an export and print the code
    Disasm {
        /// The program image (JSON) to compile
        image: PathBuf,

        /// Export whose blocks are compiled
        #[arg(long)]
        export: Option<String>,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// Load `zeta.toml` from the image's directory and make that directory
/// searchable by `import`.
fn load_config(image: &Path) -> Result<RuntimeConfig, String> {
    let dir = image
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut config = RuntimeConfig::load(dir)?;
    config.import_paths.push(dir.to_path_buf());
    Ok(config)
}

fn run_image(
    image: &Path,
    config: &RuntimeConfig,
    export: &str,
    stats: bool,
    dump_code: bool,
) -> Result<(), String> {
    let mut vm = VM::with_config(config, Box::new(io::stdout()));
    let result = vm.run_image(image, export);

    if dump_code {
        eprint!("{}", vm.disassemble());
    }
    if stats {
        let s = vm.stats();
        eprintln!("blocks compiled:       {}", s.blocks_compiled);
        eprintln!("branches resolved:     {}", s.branches_resolved);
        eprintln!("instructions executed: {}", s.instructions_executed);
        eprintln!("calls:                 {}", s.calls);
        eprintln!("code heap used:        {} bytes", vm.code_heap().len());
    }

    let value = result.map_err(|e| format!("error: {}", e))?;
    println!("{}", vm.heap().display(value));
    Ok(())
}

fn disasm_image(image: &Path, config: &RuntimeConfig, export: &str) -> Result<(), String> {
    let mut vm = VM::with_config(config, Box::new(io::stdout()));
    let compile = |vm: &mut VM| -> zeta::vm::Result<usize> {
        let pkg = vm.load_image(image)?;
        let fun = vm.export(pkg, export)?;
        let entry = vm.function_entry(fun)?;
        vm.compile_reachable(entry)
    };
    compile(&mut vm).map_err(|e| format!("error: {}", e))?;
    print!("{}", vm.disassemble());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            image,
            export,
            code_heap_size,
            stack_size,
            trace_compile,
            stats,
            dump_code,
        } => {
            init_logging();
            load_config(&image).and_then(|mut config| {
                if let Some(size) = code_heap_size {
                    config.code_heap_size = size;
                }
                if let Some(size) = stack_size {
                    config.stack_size = size;
                }
                config.trace_compile |= trace_compile;
                config.validate()?;
                let export = export.unwrap_or_else(|| config.entry_export.clone());
                run_image(&image, &config, &export, stats, dump_code)
            })
        }
        Commands::Disasm { image, export } => {
            init_logging();
            load_config(&image).and_then(|config| {
                let export = export.unwrap_or_else(|| config.entry_export.clone());
                disasm_image(&image, &config, &export)
            })
        }
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
