use anyhow::Result;
use cinder_kernel::{Kernel, MachineConfig, ThreadStatus};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a canned multi-band scheduling demo and print the trace
    Demo {
        /// Number of ticks to simulate
        #[arg(long, default_value_t = 2000)]
        ticks: u64,

        /// Ticks between timer interrupts
        #[arg(long, default_value_t = 10)]
        timer_interval: u64,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo {
            ticks,
            timer_interval,
        } => demo(ticks, timer_interval),
    }
}

fn demo(ticks: u64, timer_interval: u64) -> Result<()> {
    let mut kernel = Kernel::new(MachineConfig { timer_interval })?;

    kernel.spawn("editor", 20)?;
    kernel.spawn("compiler", 75)?;
    let daemon = kernel.spawn_user("net-daemon", 120, 1)?;

    // The daemon owns band 1 and runs first. Park it for a stretch so the
    // lower bands get the CPU, then wake it to show band-1 preemption.
    kernel.run_for(ticks / 4);
    if kernel.current() == daemon {
        kernel.block_current();
    }
    kernel.run_for(ticks / 4);
    if kernel.thread(daemon).map(|t| t.status()) == Some(ThreadStatus::Blocked) {
        kernel.wake(daemon);
    }
    kernel.run_for(ticks / 2);

    for event in kernel.trace_events() {
        println!("{event}");
    }
    print!("{}", kernel.dump_ready_lists());

    Ok(())
}
