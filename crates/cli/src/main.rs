//! Ayu CLI.
//!
//! Runs `.ayu` programs, dumps bytecode, and prints parse trees.

use std::io;
use std::path::{Path, PathBuf};
use std::process;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use tracing::debug;

mod config;
use config::Config;

#[derive(ClapParser)]
#[command(name = "ayu")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ayu interpreter - run .ayu programs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run an .ayu source file
    Run {
        /// Input .ayu source file
        input: PathBuf,

        /// Dump bytecode before running
        #[arg(long)]
        disasm: bool,
    },

    /// Disassemble an .ayu source file without running it
    Disasm {
        /// Input .ayu source file
        input: PathBuf,
    },

    /// Print the parse tree of an .ayu source file
    Ast {
        /// Input .ayu source file
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    let cfg = Config::discover().unwrap_or_else(|e| fail(&e));
    init_tracing(cfg.log_filter.as_deref());

    match cli.command {
        Commands::Run { input, disasm } => {
            run_file(&input, disasm || cfg.disasm, cfg.stack_reserve)
        }
        Commands::Disasm { input } => disasm_file(&input),
        Commands::Ast { input } => dump_ast(&input),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }
}

fn init_tracing(filter: Option<&str>) {
    let fallback = filter.unwrap_or("ayu=warn");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_writer(io::stderr)
        .init();
}

fn fail(message: &str) -> ! {
    eprintln!("error: {message}");
    process::exit(1);
}

fn run_file(input: &Path, disasm: bool, stack_reserve: Option<usize>) {
    debug!("compiling {}", input.display());
    let script = ayu_compiler::compile_file(input).unwrap_or_else(|e| fail(&e));
    debug!(
        "compiled {} ({} strings interned)",
        input.display(),
        ayu_core::intern::interned_count()
    );

    if disasm {
        if let Err(e) = ayu_core::disassemble(&script.desc.chunk, &mut io::stdout()) {
            fail(&e.to_string());
        }
    }

    let mut vm = match stack_reserve {
        Some(reserve) => ayu_runtime::Vm::with_stack_reserve(script, reserve),
        None => ayu_runtime::Vm::new(script),
    };
    ayu_runtime::install_defaults(&mut vm);
    debug!("running {}", input.display());
    let mut out = io::stdout();
    if let Err(e) = vm.run(&mut out) {
        fail(&e);
    }
}

fn disasm_file(input: &Path) {
    let script = ayu_compiler::compile_file(input).unwrap_or_else(|e| fail(&e));
    if let Err(e) = ayu_core::disassemble(&script.desc.chunk, &mut io::stdout()) {
        fail(&e.to_string());
    }
}

fn dump_ast(input: &Path) {
    let tokens = ayu_compiler::Lexer::from_path(input)
        .and_then(|lexer| lexer.lex())
        .unwrap_or_else(|e| fail(&e));
    let ast = ayu_compiler::Parser::new(tokens)
        .parse()
        .unwrap_or_else(|e| fail(&e));
    println!("{ast:#?}");
}
