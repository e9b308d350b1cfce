use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use qsnap_config::{CaptureConfig, KernelConfig};
use qsnap_core::capture::{run_capture, CaptureOptions, CaptureSession};
use qsnap_core::cpu::{extract_on_request, locate_cpu_state, publish, CpuStateExtractor};
use qsnap_core::debug::ExecutionControl;
use qsnap_core::dump::convert_raw_to_dmp;
use qsnap_core::kernel::TaskLayout;
use qsnap_core::monitor::QemuMonitor;
use qsnap_core::signal::{CompletionSignal, WaitOptions};
use qsnap_core::store::{AddressStore, SYMBOL_STORE_FILE};
use qsnap_core::target::{SnapshotTarget, DUMP_FILE};
use qsnap_rsp::RspClient;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

const EXIT_PASS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for the snapshot breakpoint and capture the guest into the target directory
    Capture {
        /// Path to the capture config (YAML)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Extract the guest CPU state from the host process and write regs.json
    Cpu {
        /// Path to the capture config (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Block until a capture session asks for the CPU state
        #[arg(long)]
        wait: bool,
    },
    /// Convert a raw physical memory image to mem.dmp next to it
    Raw2dmp {
        /// Raw image written by the VM monitor
        raw: PathBuf,
    },
    /// Inspect or update the address store
    Store {
        /// Store file
        #[arg(long, default_value = SYMBOL_STORE_FILE)]
        store: PathBuf,

        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand, Debug)]
enum StoreAction {
    /// Merge key=value entries; numeric values are stored as hex
    Set {
        #[arg(required = true)]
        entries: Vec<String>,
    },
    /// Print the store as JSON
    Show,
}

/// Failure class, mapped to the process exit status.
enum Failure {
    Config(anyhow::Error),
    Run(anyhow::Error),
}

impl From<anyhow::Error> for Failure {
    fn from(e: anyhow::Error) -> Self {
        Failure::Run(e)
    }
}

impl From<qsnap_core::CaptureError> for Failure {
    fn from(e: qsnap_core::CaptureError) -> Self {
        Failure::Run(e.into())
    }
}

fn config_error(e: anyhow::Error) -> Failure {
    Failure::Config(e)
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr so `store show` output stays machine readable.
    let level = if args.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match args.command {
        Command::Capture { config } => capture(&config),
        Command::Cpu { config, wait } => cpu(&config, wait),
        Command::Raw2dmp { raw } => raw2dmp(&raw),
        Command::Store { store, action } => store_command(&store, action),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_PASS),
        Err(Failure::Config(e)) => {
            error!("Configuration error: {:#}", e);
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
        Err(Failure::Run(e)) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn load_config(path: &Path) -> Result<CaptureConfig, Failure> {
    info!("Loading capture config: {:?}", path);
    CaptureConfig::from_file(path).map_err(config_error)
}

/// Kernel offsets for the process identity check, filling gaps from the image.
fn task_layout(kernel: &KernelConfig) -> Result<TaskLayout> {
    let mut per_cpu_offset = kernel.per_cpu_offset;
    let mut current_task = kernel.current_task;

    if per_cpu_offset.is_none() || current_task.is_none() {
        let image = kernel
            .image
            .as_ref()
            .context("Kernel 'per_cpu_offset'/'current_task' not set and no 'image' to resolve them from")?;
        let found = qsnap_loader::resolve_symbols(image, &["__per_cpu_offset", "current_task"])?;
        per_cpu_offset = per_cpu_offset.or_else(|| found.get("__per_cpu_offset").copied());
        current_task = current_task.or_else(|| found.get("current_task").copied());
    }

    match (per_cpu_offset, current_task) {
        (Some(per_cpu_offset), Some(current_task)) => Ok(TaskLayout {
            per_cpu_offset,
            current_task,
            comm_offset: kernel.comm_offset,
        }),
        _ => bail!("Could not resolve '__per_cpu_offset' and 'current_task'"),
    }
}

fn capture(config_path: &Path) -> Result<(), Failure> {
    let config = load_config(config_path)?;
    let root = config.resolve_targets_root().map_err(config_error)?;
    let memory_size = config.memory_size_bytes().map_err(config_error)?;

    let identity = match (&config.kernel, config.target.check_name) {
        (Some(kernel), true) => Some(task_layout(kernel).map_err(config_error)?),
        _ => None,
    };

    let mut extra_addresses = BTreeMap::new();
    if let Some(image) = config.kernel.as_ref().and_then(|k| k.image.as_ref()) {
        extra_addresses = qsnap_loader::kernel_handler_addresses(image)?;
    }

    let symbols = match &config.target.symbols {
        Some(path) => qsnap_loader::load_function_symbols(path)?,
        None => BTreeMap::new(),
    };
    let target = SnapshotTarget::new(
        &root,
        &config.target.name,
        &config.target.program,
        config.target.base,
    )
    .with_symbols(symbols);

    let mut options = CaptureOptions::new(&config.work_dir);
    options.identity = identity;
    options.hits_required = config.target.hits_required;
    options.memory_size = memory_size;
    options.wait = WaitOptions::from(&config.wait);
    options.extra_addresses = extra_addresses;

    let mut session = CaptureSession::new(
        options,
        target,
        Box::new(QemuMonitor::new(config.monitor.clone())),
    );

    let mut guest = RspClient::connect(&config.guest_gdb)
        .with_context(|| format!("Failed to attach to the guest at {}", config.guest_gdb))?;
    info!(
        "Waiting for {} to reach {:#x}",
        config.target.program, config.target.breakpoint
    );
    run_capture(&mut guest, &mut session, config.target.breakpoint)?;

    info!(
        "Snapshot written to {:?}",
        session.target().dump_path()
    );
    Ok(())
}

fn cpu(config_path: &Path, wait: bool) -> Result<(), Failure> {
    let config = load_config(config_path)?;
    let Some(host) = &config.host else {
        return Err(Failure::Config(anyhow::anyhow!(
            "A 'host' section is required to extract the CPU state"
        )));
    };

    let signal = CompletionSignal::in_dir(&config.work_dir);
    let mut dbg = RspClient::connect(&host.gdb)
        .with_context(|| format!("Failed to attach to the host process at {}", host.gdb))?;

    let regs = if wait {
        info!("Waiting for a capture request in {:?}", config.work_dir);
        extract_on_request(
            &mut dbg,
            &host.cpu,
            &host.layout,
            &signal,
            WaitOptions::from(&config.wait),
        )?
    } else {
        let cpu_state = locate_cpu_state(&mut dbg, &host.cpu)?;
        let extractor = CpuStateExtractor::new(&host.layout);
        let env = extractor.env_address(&mut dbg, cpu_state)?;
        extractor.extract(&mut dbg, env)?
    };
    publish(&regs, &signal, &AddressStore::in_dir(&config.work_dir))?;

    dbg.detach()?;
    Ok(())
}

fn raw2dmp(raw: &Path) -> Result<(), Failure> {
    if raw.file_name().is_some_and(|n| n == DUMP_FILE) {
        return Err(Failure::Config(anyhow::anyhow!(
            "Raw file {:?} would be overwritten by its own dump",
            raw
        )));
    }
    let out = raw.with_file_name(DUMP_FILE);
    let layout = convert_raw_to_dmp(raw, &out)
        .with_context(|| format!("Failed to convert {:?}", raw))?;
    info!("Wrote {:?} ({} pages)", out, layout.pages);
    Ok(())
}

fn store_command(path: &Path, action: StoreAction) -> Result<(), Failure> {
    let store = AddressStore::new(path);
    match action {
        StoreAction::Set { entries } => {
            let mut parsed = Vec::with_capacity(entries.len());
            for entry in &entries {
                let Some((key, value)) = entry.split_once('=') else {
                    return Err(Failure::Config(anyhow::anyhow!(
                        "Expected key=value, got '{}'",
                        entry
                    )));
                };
                let value = match qsnap_config::parse_u64(value) {
                    Ok(addr) => serde_json::Value::String(format!("{:#x}", addr)),
                    Err(_) => serde_json::Value::String(value.to_string()),
                };
                parsed.push((key.to_string(), value));
            }
            store.merge(parsed)?;
            info!("Updated {:?}", store.path());
        }
        StoreAction::Show => {
            let entries = store.load()?;
            let text = serde_json::to_string_pretty(&entries).context("Failed to render store")?;
            println!("{}", text);
        }
    }
    Ok(())
}
