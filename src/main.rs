/// Command-line driver for the print order manager
///
/// Each subcommand opens a session over the filesystem store, runs one
/// flow and prints the result. Logging goes through `RUST_LOG`.
use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use print_order::config::Settings;
use print_order::preview;
use print_order::shell::DesktopShell;
use print_order::state::{
    data::normalize_qty, FileBlob, MatchOutcome, MonitorFilter, OrderDraft, OrderPatch, OrderStatus, Session,
    SessionEvent,
};
use print_order::storage::FsOrderStore;
use print_order::watch::FolderWatcher;
use tokio::sync::mpsc::UnboundedReceiver;

/// Any error is printed by `main` and exits non-zero
type CliResult = Result<(), Box<dyn Error>>;
/// Session over the real filesystem and desktop
type AppSession = Session<FsOrderStore, DesktopShell, FolderWatcher>;

#[derive(Parser)]
#[command(author, version, about = "3D-print job orders as folders", long_about = None)]
/// Global options apply to every subcommand
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Order base directory, overriding the settings file
    #[arg(long = "base-dir", global = true)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
/// One subcommand per order or watch-folder flow
enum Commands {
    /// Render a preview PNG for one model file
    Preview {
        file: PathBuf,
        /// Output path (defaults to `<file>.preview.png`)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List orders under the base directory
    Orders,
    /// Create an order and commit files into it, previews included
    NewOrder {
        #[arg(long)]
        title: String,
        #[arg(long)]
        customer: String,
        #[arg(long, default_value = "")]
        material: String,
        /// Copies of the whole order
        #[arg(long, default_value_t = 1)]
        quantity: u32,
        #[arg(long, default_value = "")]
        note: String,
        /// Files to store; an order may start empty
        files: Vec<PathBuf>,
    },
    /// Append files to an existing order
    Add {
        order: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Set print / printed quantities of a stored file
    Qty {
        order: String,
        /// Name of the file inside the order folder
        stored_name: String,
        /// Copies to print, at least 1
        print: String,
        /// Copies done so far, at most `print`
        printed: String,
    },
    /// Set the status of an order (新建/打印中/后处理/已完成/已取消, or
    /// new/printing/post-processing/done/canceled)
    Status {
        order: String,
        status: OrderStatus,
        /// Shipping info to record along with the status
        #[arg(long)]
        shipping: Option<String>,
    },
    /// Set the note shown on an order folder
    Note { order: String, note: String },
    /// Duplicate an order under the next order number
    Copy { order: String },
    /// Delete an order folder and everything in it
    Rm { order: String },
    /// Overwrite a stored file with another file, keeping its stored name
    Replace {
        order: String,
        stored_name: String,
        /// New content; its file name becomes the display name
        file: PathBuf,
    },
    /// Watch a folder and show the files offered for import
    Watch {
        /// Folder to watch (defaults to the last watched folder)
        folder: Option<PathBuf>,
        /// Also offer files that were already present
        #[arg(long)]
        all: bool,
        /// How many times to poll for new arrivals
        #[arg(long, default_value_t = 1)]
        polls: u32,
        /// Seconds between polls
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
    /// Store the order base directory in the settings file
    SetBaseDir { dir: PathBuf },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> CliResult {
    tracing_subscriber::fmt()
        // RUST_LOG wins; default is info for this crate only
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("print_order=info")))
        .init();

    let cli = Cli::parse();

    // Settings file: explicit path or the per-user default
    let settings_path = match cli.config {
        Some(path) => path,
        None => Settings::default_path()?,
    };
    // --base-dir overrides the stored base directory for this run
    let mut store = FsOrderStore::new(settings_path);
    if let Some(dir) = cli.base_dir {
        store = store.with_base_dir(dir);
    }

    match cli.command {
        // Commands that do not need a session
        Commands::Preview { file, out } => preview_file(&file, out).await,
        Commands::Watch {
            folder,
            all,
            polls,
            interval,
        } => {
            // Fall back to the folder remembered from the last run
            let folder = match folder {
                Some(folder) => folder,
                None => store.settings().await?.watch_folder.ok_or("no folder given and none remembered")?,
            };
            store.set_watch_folder(&folder).await?;

            let (mut session, events) = Session::new(store, DesktopShell::new(), FolderWatcher::new());
            let result = watch(&mut session, &folder, all, polls, Duration::from_secs(interval)).await;
            drain_events(events);
            result
        }
        // Also creates the folder
        Commands::SetBaseDir { dir } => {
            let settings = store.set_base_dir(&dir).await?;
            println!("Base directory: {}", dir.display());
            println!("Last order number: {}", settings.last_order_number);
            Ok(())
        }
        command => {
            let (mut session, events) = Session::new(store, DesktopShell::new(), FolderWatcher::new());
            let result = run(&mut session, command).await;
            drain_events(events);
            result
        }
    }
}

/// Run one command that needs a session
async fn run(session: &mut AppSession, command: Commands) -> CliResult {
    match command {
        Commands::Orders => {
            session.refresh_orders().await?;
            for order in session.orders() {
                println!(
                    "{}  #{:04}  {}  {} file(s)",
                    order.dir_name,
                    order.order_no,
                    order.status,
                    order.files.len()
                );
            }
        }
        Commands::NewOrder {
            title,
            customer,
            material,
            quantity,
            note,
            files,
        } => {
            // Same path as a drop: pending entries first, previews filled in
            let paths: Vec<String> = files.iter().map(|p| p.to_string_lossy().into_owned()).collect();
            session.drop_paths(&paths).await;

            // Quantity 0 on the command line means 1
            let draft = OrderDraft {
                title,
                customer_name: customer,
                material,
                quantity: quantity.max(1),
                note,
                ..OrderDraft::default()
            };
            // Creates the folder, stores the files, then pairs previews
            let result = session.submit_order(&draft).await?;

            println!("Created {}", result.order.dir_name);
            for record in &result.order.files {
                let preview = record.preview_image.as_deref().unwrap_or("-");
                println!("  {} -> {} (preview: {})", record.name, record.saved_as, preview);
            }
            report_mismatches(&result.outcomes);
        }
        Commands::Add { order, files } => {
            // Read as bytes so previews are generated before storing
            let mut blobs = Vec::with_capacity(files.len());
            for path in &files {
                blobs.push(read_blob(path).await?);
            }
            // Mismatched previews are reported, not fatal
            let result = session.add_raw_files_to_order(&order, blobs).await?;
            info!(dir = %order, paired = result.paired_count(), "files added");
            println!("{} now has {} file(s)", order, result.order.files.len());
            report_mismatches(&result.outcomes);
        }
        Commands::Qty {
            order,
            stored_name,
            print,
            printed,
        } => {
            // Free-form input, clamped again by the session
            let print = normalize_qty(&print, 1);
            let printed = normalize_qty(&printed, 0);
            let updated = session
                .set_order_file_quantities(&order, &stored_name, print, printed)
                .await?;
            match updated.file(&stored_name) {
                Some(record) => println!("{}: {}/{}", stored_name, record.printed_qty, record.print_qty),
                None => println!("{} has no file named {}", order, stored_name),
            }
        }
        Commands::Status {
            order,
            status,
            shipping,
        } => {
            // Status and shipping info in one manifest write
            let patch = OrderPatch {
                status: Some(status),
                shipping_info: shipping,
                ..OrderPatch::default()
            };
            let updated = session.update_order(&order, &patch).await?;
            println!("{}: {}", updated.dir_name, updated.status);
        }
        Commands::Note { order, note } => {
            // Trimmed by the session
            let updated = session.set_order_note(&order, &note).await?;
            println!("{}: {}", updated.dir_name, updated.folder_note);
        }
        Commands::Copy { order } => {
            // Copy gets the next number and status 新建
            let copied = session.copy_order(&order).await?;
            println!("Copied {} -> {} (#{:04})", order, copied.dir_name, copied.order_no);
        }
        Commands::Rm { order } => {
            // Not found is reported, not an error
            if session.delete_order(&order).await? {
                println!("Deleted {}", order);
            } else {
                println!("No order named {}", order);
            }
        }
        Commands::Replace {
            order,
            stored_name,
            file,
        } => {
            // Unknown stored names leave the order untouched
            let updated = session.replace_order_file(&order, &stored_name, &file).await?;
            match updated.file(&stored_name) {
                Some(record) => println!("{} now holds {}", stored_name, record.name),
                None => println!("{} has no file named {}", order, stored_name),
            }
        }
        // Handled before a session is opened
        Commands::Preview { .. } | Commands::SetBaseDir { .. } | Commands::Watch { .. } => {}
    }

    Ok(())
}

/// Watch `folder`, then poll for arrivals `polls` times
async fn watch(session: &mut AppSession, folder: &Path, all: bool, polls: u32, interval: Duration) -> CliResult {
    // Filter before watching so `--all` lists what is already there
    let filter = if all { MonitorFilter::All } else { MonitorFilter::New };
    session.set_monitor_filter(filter).await?;
    session.watch_folder(folder).await?;
    println!("Watching {}", folder.display());

    // Existing files are only offered with --all
    print_candidates(session, filter);

    for _ in 0..polls {
        // Arrivals are picked up by polling
        tokio::time::sleep(interval).await;
        // Only reprint when something new showed up
        let arrived = session.refresh_monitor().await?;
        if arrived > 0 {
            print_candidates(session, filter);
        }
    }

    if session.monitor().candidates(filter).is_empty() {
        println!("No files to import in {}", folder.display());
    }
    Ok(())
}

/// One line per file the filter shows, with its review status
fn print_candidates(session: &AppSession, filter: MonitorFilter) {
    for file in session.monitor().visible(filter) {
        println!("[{}] {} ({} bytes)", file.status.label(), file.path.display(), file.size);
    }
}

/// Log whatever the session announced; there is no UI to update
fn drain_events(mut events: UnboundedReceiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        debug!(?event, "session event");
    }
}

/// Render one file to `<file>.preview.png` or `out`
async fn preview_file(file: &Path, out: Option<PathBuf>) -> CliResult {
    let bytes = tokio::fs::read(file).await?;
    let name = file.to_string_lossy().into_owned();

    // Keep the error kind so the user sees why it failed
    let image = tokio::task::spawn_blocking(move || preview::try_generate_preview(&name, &bytes)).await??;

    let out = out.unwrap_or_else(|| {
        let mut path = file.as_os_str().to_owned();
        path.push(".preview.png");
        PathBuf::from(path)
    });
    tokio::fs::write(&out, image.as_bytes()).await?;
    println!("Wrote {} ({} bytes)", out.display(), image.len());
    Ok(())
}

/// File contents plus the name and mtime used for pending identity
async fn read_blob(path: &Path) -> Result<FileBlob, Box<dyn Error>> {
    let bytes = tokio::fs::read(path).await?;
    // Missing mtime counts as 0
    let modified = tokio::fs::metadata(path)
        .await?
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    Ok(FileBlob::new(name, bytes, modified))
}

/// Tell the user about previews that found no stored file
fn report_mismatches(outcomes: &[MatchOutcome]) {
    let missed = outcomes.iter().filter(|o| **o == MatchOutcome::Mismatch).count();
    if missed > 0 {
        println!("{} preview(s) could not be matched to a stored file", missed);
    }
}
