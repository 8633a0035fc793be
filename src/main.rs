//! vm-state CLI - Manage portable MicroVM states

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vm_state::backend::ZfsCliBackend;
use vm_state::ownership::require_root;
use vm_state::vm::Systemctl;
use vm_state::{Config, Error, Result, Slot, Snapshot, State, VmStateManager, VmStatus};

type Manager = VmStateManager<ZfsCliBackend, Systemctl>;

#[derive(Parser)]
#[command(name = "vm-state")]
#[command(about = "Manage portable MicroVM states", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(long, short, global = true, env = "VM_STATE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List slots, states and snapshots
    List,

    /// Show status of one slot or all slots
    Status {
        /// Slot to inspect
        slot: Option<Slot>,
    },

    /// Create a new empty state
    Create {
        /// Name for the new state
        name: State,
    },

    /// Snapshot the state assigned to a slot
    Snapshot {
        /// Slot to snapshot
        slot: Slot,
        /// Name for the snapshot
        name: Snapshot,
    },

    /// Snapshot a state by name
    SnapshotState {
        /// State to snapshot
        state: State,
        /// Name for the snapshot
        name: Snapshot,
    },

    /// List snapshots of one state or all states
    Snapshots {
        state: Option<State>,
    },

    /// Delete a snapshot
    DeleteSnapshot {
        /// State owning the snapshot
        state: State,
        /// Snapshot name
        name: Snapshot,
    },

    /// Assign a state to a slot
    Assign {
        /// Slot to assign to
        slot: Slot,
        /// State to assign
        state: State,
    },

    /// Clone a state to a new name
    Clone {
        /// Source state to clone
        source: State,
        /// Destination state name
        destination: State,
    },

    /// Delete a state (must not be in use)
    Delete {
        /// State to delete
        name: State,
        /// Delete even if a slot is assigned to it
        #[arg(long)]
        force: bool,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Stop slot, assign state, start slot
    Migrate {
        /// State to migrate
        state: State,
        /// Slot to migrate to
        slot: Slot,
    },

    /// Restore a snapshot to a new state
    Restore {
        /// Snapshot name to restore
        snapshot: Snapshot,
        /// New state name
        state: State,
    },

    /// Start a slot
    Start { slot: Slot },

    /// Stop a slot
    Stop { slot: Slot },

    /// Restart a slot
    Restart { slot: Slot },

    /// Repair slot links and finish clones left pending by failed operations
    Reconcile,
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.1}T", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

fn status_label(status: VmStatus) -> String {
    match status {
        VmStatus::Running => "running".green().to_string(),
        VmStatus::Stopped => "stopped".to_string(),
        VmStatus::Failed => "failed".red().to_string(),
        VmStatus::Unknown => "unknown".yellow().to_string(),
    }
}

fn cmd_list(manager: &Manager) -> Result<()> {
    info("States and assignments:");
    println!();
    cmd_status(manager, None)?;

    println!();
    info("Available states (ZFS datasets):");
    let states = manager.list_states()?;
    if states.is_empty() {
        println!("  (no states created yet)");
    } else {
        for state_info in states {
            println!(
                "  {:<20} used: {:<8} avail: {:<8} {}",
                state_info.state,
                format_size(state_info.used_bytes),
                format_size(state_info.available_bytes),
                state_info.zfs_dataset
            );
        }
    }

    println!();
    info("Snapshots:");
    let snapshots = manager.list_snapshots(None)?;
    if snapshots.is_empty() {
        println!("  (no snapshots)");
    } else {
        for snap in snapshots.iter().take(20) {
            println!("  {}", snap.full_name);
        }
        if snapshots.len() > 20 {
            println!("  ... and {} more", snapshots.len() - 20);
        }
    }

    Ok(())
}

fn cmd_status(manager: &Manager, slot: Option<Slot>) -> Result<()> {
    let infos = match slot {
        Some(slot) => vec![manager.get_info(&slot)?],
        None => manager.list_slots()?,
    };

    println!("{:<10} {:<20} {:<10} {}", "SLOT", "STATE", "STATUS", "IP");
    println!("{:<10} {:<20} {:<10} {}", "----", "-----", "------", "--");
    for vm in infos {
        println!(
            "{:<10} {:<20} {:<10} {}",
            vm.slot,
            vm.assigned_state,
            status_label(vm.status),
            vm.ip
        );
    }
    Ok(())
}

fn cmd_create(manager: &Manager, state: &State) -> Result<()> {
    info(&format!("Creating state '{}'...", state));
    manager.create_state(state)?;
    success(&format!(
        "State '{}' created at {}",
        state,
        manager.store().state_dir(state).display()
    ));
    info(&format!("Assign it to a slot with: vm-state assign <slot> {}", state));

    Ok(())
}

fn cmd_snapshot(manager: &Manager, slot: &Slot, snapshot: &Snapshot) -> Result<()> {
    let state = manager.get_slot_state(slot)?;

    if manager.is_running(slot)? {
        warn(&format!("{} is running - snapshot will be crash-consistent", slot));
        warn(&format!(
            "For a clean snapshot, stop the slot first: vm-state stop {}",
            slot
        ));
    }

    info(&format!("Creating snapshot of state '{}' (from {})...", state, slot));
    manager.snapshot_slot(slot, snapshot)?;
    success(&format!(
        "Snapshot created: {}@{}",
        manager.store().dataset_path(&state),
        snapshot
    ));

    Ok(())
}

fn cmd_snapshot_state(manager: &Manager, state: &State, snapshot: &Snapshot) -> Result<()> {
    if let Some(slot) = manager.is_state_in_use(state)? {
        if manager.is_running(&slot)? {
            warn(&format!(
                "State '{}' is in use by running {} - snapshot will be crash-consistent",
                state, slot
            ));
        }
    }

    manager.create_snapshot(state, snapshot)?;
    success(&format!(
        "Snapshot created: {}@{}",
        manager.store().dataset_path(state),
        snapshot
    ));
    Ok(())
}

fn cmd_snapshots(manager: &Manager, state: Option<&State>) -> Result<()> {
    let snapshots = manager.list_snapshots(state)?;
    if snapshots.is_empty() {
        println!("  (no snapshots)");
        return Ok(());
    }
    println!("{:<20} {:<24} {:<12} {}", "STATE", "SNAPSHOT", "CREATED", "REFER");
    for snap in snapshots {
        println!(
            "{:<20} {:<24} {:<12} {}",
            snap.state,
            snap.snapshot,
            snap.creation,
            format_size(snap.referenced_bytes)
        );
    }
    Ok(())
}

fn cmd_delete_snapshot(manager: &Manager, state: &State, snapshot: &Snapshot) -> Result<()> {
    info(&format!("Deleting snapshot '{}@{}'...", state, snapshot));
    manager.delete_snapshot(state, snapshot)?;
    success(&format!("Snapshot '{}@{}' deleted", state, snapshot));
    Ok(())
}

fn cmd_assign(manager: &Manager, slot: &Slot, state: &State) -> Result<()> {
    let was_running = manager.is_running(slot)?;
    if was_running {
        warn(&format!(
            "{} is currently running. Assignment will take effect after restart.",
            slot
        ));
    }

    if !manager.state_exists(state)? {
        warn(&format!("State '{}' doesn't exist yet. Creating it...", state));
    }

    manager.assign_state(slot, state)?;

    info(&format!(
        "Linked {} -> {}",
        manager.links().slot_backing_file(slot).display(),
        manager.store().state_backing_file(state).display()
    ));
    success(&format!("Assigned state '{}' to {}", state, slot));

    if was_running {
        info(&format!("Restart the slot to use the new state: vm-state restart {}", slot));
    } else {
        info(&format!("Start the slot with: vm-state start {}", slot));
    }

    Ok(())
}

fn cmd_clone(manager: &Manager, source: &State, destination: &State) -> Result<()> {
    info(&format!("Cloning state '{}' to '{}'...", source, destination));
    manager.clone_state(source, destination)?;
    success(&format!("State '{}' cloned to '{}'", source, destination));
    info(&format!(
        "Assign it to a slot with: vm-state assign <slot> {}",
        destination
    ));

    Ok(())
}

fn cmd_delete(manager: &Manager, state: &State, force: bool, yes: bool) -> Result<()> {
    warn(&format!(
        "This will permanently delete state '{}' and all its data!",
        state
    ));

    if !yes {
        print!("Type 'DELETE' to confirm: ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if input.trim() != "DELETE" {
            return Err(Error::Other("Aborted".to_string()));
        }
    }

    info(&format!("Deleting state '{}'...", state));
    manager.delete_state(state, force)?;
    success(&format!("State '{}' deleted", state));

    Ok(())
}

fn cmd_migrate(manager: &Manager, state: &State, slot: &Slot) -> Result<()> {
    info(&format!("Migrating state '{}' to {}...", state, slot));

    if manager.is_running(slot)? {
        info(&format!("Stopping {}...", slot));
    }

    manager.migrate(state, slot)?;
    success(&format!(
        "Migration complete. {} is starting with state '{}'",
        slot, state
    ));

    Ok(())
}

fn cmd_restore(manager: &Manager, snapshot: &Snapshot, state: &State) -> Result<()> {
    info(&format!(
        "Restoring snapshot '{}' to state '{}'...",
        snapshot, state
    ));
    manager.restore_snapshot(snapshot, state)?;
    success(&format!("Snapshot restored to state '{}'", state));
    info(&format!("Assign it to a slot with: vm-state assign <slot> {}", state));

    Ok(())
}

fn cmd_start(manager: &Manager, slot: &Slot) -> Result<()> {
    info(&format!("Starting {}...", slot));
    manager.start(slot)?;
    success(&format!("{} start queued", slot));

    Ok(())
}

fn cmd_stop(manager: &Manager, slot: &Slot) -> Result<()> {
    info(&format!("Stopping {}...", slot));
    manager.stop(slot)?;
    success(&format!("{} stop queued", slot));

    Ok(())
}

fn cmd_restart(manager: &Manager, slot: &Slot) -> Result<()> {
    info(&format!("Restarting {}...", slot));
    manager.restart(slot)?;
    success(&format!("{} restart queued", slot));

    Ok(())
}

fn cmd_reconcile(manager: &Manager) -> Result<()> {
    info("Reconciling slot links and unfinished clones...");
    let report = manager.reconcile()?;

    for slot in &report.relinked {
        success(&format!("Relinked {}", slot));
    }
    for state in &report.completed_clones {
        success(&format!("Completed unfinished clone '{}'", state));
    }
    for (slot, state) in &report.missing_states {
        warn(&format!("{} is assigned to missing state '{}'", slot, state));
    }
    for (target, reason) in &report.failed {
        error(&format!("Could not repair {}: {}", target, reason));
    }

    if report.failed.is_empty() {
        if report.is_clean() {
            success("Nothing to repair");
        }
        Ok(())
    } else {
        Err(Error::Other(format!("{} repairs failed", report.failed.len())))
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::discover(cli.config.as_deref())?;

    let mutating = !matches!(
        cli.command,
        None | Some(Commands::List)
            | Some(Commands::Status { .. })
            | Some(Commands::Snapshots { .. })
    );
    if mutating {
        require_root()?;
    }

    let manager = VmStateManager::system(config)?;

    match cli.command {
        None | Some(Commands::List) => cmd_list(&manager),
        Some(Commands::Status { slot }) => cmd_status(&manager, slot),
        Some(Commands::Create { name }) => cmd_create(&manager, &name),
        Some(Commands::Snapshot { slot, name }) => cmd_snapshot(&manager, &slot, &name),
        Some(Commands::SnapshotState { state, name }) => {
            cmd_snapshot_state(&manager, &state, &name)
        }
        Some(Commands::Snapshots { state }) => cmd_snapshots(&manager, state.as_ref()),
        Some(Commands::DeleteSnapshot { state, name }) => {
            cmd_delete_snapshot(&manager, &state, &name)
        }
        Some(Commands::Assign { slot, state }) => cmd_assign(&manager, &slot, &state),
        Some(Commands::Clone { source, destination }) => cmd_clone(&manager, &source, &destination),
        Some(Commands::Delete { name, force, yes }) => cmd_delete(&manager, &name, force, yes),
        Some(Commands::Migrate { state, slot }) => cmd_migrate(&manager, &state, &slot),
        Some(Commands::Restore { snapshot, state }) => cmd_restore(&manager, &snapshot, &state),
        Some(Commands::Start { slot }) => cmd_start(&manager, &slot),
        Some(Commands::Stop { slot }) => cmd_stop(&manager, &slot),
        Some(Commands::Restart { slot }) => cmd_restart(&manager, &slot),
        Some(Commands::Reconcile) => cmd_reconcile(&manager),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
