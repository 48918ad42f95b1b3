use crate::config::types::{Method, OpcodeConfig, StressExit};
use crate::exec::harness::{BoardSlot, BudgetHarness, OpsBoard, StressHarness};
use crate::exec::stress_opcode;
use crate::kernel::{capabilities, probe, seccomp, signal, text};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "Random opcode execution stressor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run opcode workers until their budget is spent
    Run {
        /// Generation method
        #[arg(long)]
        method: Option<Method>,
        /// Number of worker instances, each in its own process
        #[arg(long)]
        instances: Option<u32>,
        /// Generations per instance (0 = unbounded)
        #[arg(long)]
        ops: Option<u64>,
        /// Time budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Count fatal signals raised by generated code
        #[arg(long)]
        track_signals: bool,
        /// JSON config file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List valid generation methods
    Methods,
    /// Report which sandboxing primitives this host provides
    Probe {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            method,
            instances,
            ops,
            timeout,
            track_signals,
            config,
        } => {
            let mut cfg = match config {
                Some(path) => OpcodeConfig::load_from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => OpcodeConfig::default(),
            };
            if let Some(method) = method {
                cfg.method = method;
            }
            if let Some(instances) = instances {
                cfg.instances = instances;
            }
            if let Some(ops) = ops {
                cfg.max_ops = ops;
            }
            if timeout.is_some() {
                cfg.timeout_secs = timeout;
            }
            cfg.track_signals |= track_signals;
            cfg.validate()?;

            let signals = signal::SignalHandler::init().map_err(anyhow::Error::msg)?;
            let exit = run_instances(&cfg)?;
            if signals.shutdown_requested() {
                log::info!("opcode: stopped early by signal {}", signals.get_signal());
            }
            log::info!("opcode: finished with {}", exit);
            std::process::exit(exit.into());
        }
        Commands::Methods => {
            for method in Method::ALL {
                println!("{}", method);
            }
            Ok(())
        }
        Commands::Probe { json } => {
            let support = probe::probe();
            if json {
                println!("{}", serde_json::to_string_pretty(&support)?);
            } else {
                println!("seccomp filter:   {}", support.seccomp_filter);
                println!("executable pages: {}", support.executable_pages);
                println!("no_new_privs:     {}", support.no_new_privs);
                println!("interval timer:   {}", support.interval_timer);
                match text::resolve_text_region() {
                    Some(region) => println!("text segment:     {} bytes", region.len()),
                    None => println!("text segment:     unavailable"),
                }
                if let Some(mode) = seccomp::get_seccomp_status() {
                    println!("seccomp mode:     {}", mode);
                }
                if let Ok(dumpable) = capabilities::check_dumpable() {
                    println!("dumpable:         {}", dumpable);
                }
                if let Ok(held) = capabilities::nonzero_capability_sets() {
                    if held.is_empty() {
                        println!("capabilities:     none held");
                    } else {
                        println!("capabilities:     held in {}", held.join(", "));
                    }
                }
                if support.is_supported() {
                    println!("supported");
                } else {
                    println!("not supported, missing {}", support.missing().join(", "));
                }
            }
            Ok(())
        }
    }
}

fn run_one(config: &OpcodeConfig, slot: Option<BoardSlot<'_>>) -> StressExit {
    let mut harness = BudgetHarness::from_config(config).with_shutdown_flag(signal::shutdown_flag());
    if let Some(slot) = slot {
        harness = harness.with_board(slot);
    }
    let exit = stress_opcode(config, &mut harness);
    log::debug!("{}: {} after {} operations", harness.name(), exit, harness.ops());
    exit
}

/// Fork one worker process per instance and wait for all of them.
fn run_instances(config: &OpcodeConfig) -> Result<StressExit> {
    if config.instances == 1 {
        return Ok(run_one(config, None));
    }

    let board = OpsBoard::map(config.instances as usize)?;
    let mut workers: Vec<(u32, Pid)> = Vec::new();

    for instance in 0..config.instances {
        let mut instance_config = config.clone();
        instance_config.instance = instance;

        // SAFETY: the CLI is single-threaded here; the child runs a complete
        // worker and exits without returning into this loop.
        match unsafe { fork() }.context("forking worker")? {
            ForkResult::Child => {
                let exit = run_one(&instance_config, board.slot(instance as usize));
                std::process::exit(exit.into());
            }
            ForkResult::Parent { child } => workers.push((instance, child)),
        }
    }

    let mut result = StressExit::Success;
    for (instance, pid) in workers {
        let exit = wait_worker(pid);
        log::debug!("opcode-{}: worker {} ended with {}", instance, pid, exit);
        if result == StressExit::Success || exit == StressExit::Failure {
            result = exit;
        }
    }

    log::info!(
        "opcode: {} operations across {} instances ({:?})",
        board.total(),
        config.instances,
        board.counts()
    );
    Ok(result)
}

fn wait_worker(pid: Pid) -> StressExit {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return StressExit::from_code(code).unwrap_or(StressExit::Failure)
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                log::warn!("Worker {} killed by {}", pid, sig);
                return StressExit::Failure;
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("waitpid({}) failed: {}", pid, e);
                return StressExit::Failure;
            }
        }
    }
}
