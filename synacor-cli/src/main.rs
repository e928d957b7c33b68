use std::io::Read;
use std::path::PathBuf;

use term::{Console, Output, Report};
use vm::{Status, Vm};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

/// Synacor runner
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Program image to load and execute
    rom: PathBuf,

    /// File whose contents are typed in before reading from stdin
    #[clap(long)]
    script: Option<PathBuf>,

    /// Stop after executing this many instructions
    #[clap(long)]
    max_steps: Option<usize>,

    /// Print the CPU status to stderr when execution stops
    #[clap(long)]
    dump: bool,
}

fn main() -> Result<()> {
    let env = env_logger::Env::default()
        .filter_or("SYNACOR_LOG", "info")
        .write_style_or("SYNACOR_LOG", "always");
    env_logger::init_from_env(env);

    let args = Args::parse();
    let mut f = std::fs::File::open(&args.rom)
        .with_context(|| format!("failed to open {:?}", args.rom))?;

    let mut rom = vec![];
    f.read_to_end(&mut rom).context("failed to read file")?;

    let mut console = Console::new(term::console_worker());
    if let Some(path) = &args.script {
        let script = std::fs::read(path)
            .with_context(|| format!("failed to read script {path:?}"))?;
        console = console.with_script(&script);
    }

    let mut vm = Vm::new(console, Output::stdout());
    let extra = vm.load(&rom);
    if !extra.is_empty() {
        warn!("image is too large; ignoring last {} bytes", extra.len());
    }

    let start = std::time::Instant::now();
    let status = vm.run_until(|_vm, i| args.max_steps.is_some_and(|n| i >= n));
    vm.output_mut().flush();
    info!("stopped after {:?}", start.elapsed());

    if args.dump {
        eprintln!("{}", Report(&vm));
    }

    match status {
        Status::Halted => Ok(()),
        Status::Running => {
            warn!("step limit reached at {:#06x}", vm.pc());
            Ok(())
        }
        Status::Faulted(e) => Err(e).context("program faulted"),
    }
}
