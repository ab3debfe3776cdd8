use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kv_restore::Result;
use kv_restore::config::Settings;
use kv_restore::driver::Restorer;
use kv_restore::events::{EventSink, NullSink, StdoutSink};
use kv_restore::export::{ExportOptions, export_snapshot};
use kv_restore::task::TaskRecord;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Config TOML (falls back to $KVRESTORE_CONFIG, then defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decode a backup and create a restore task
    ///
    /// With the default in-memory store, task state is lost when the process exits;
    /// use `--wait` or configure `store.backend = "fs"`.
    Restore {
        /// Backup file (JSON document, multipart body, or JSON as text/plain)
        file: PathBuf,
        /// Content type of the file (default: guessed from the extension)
        #[arg(long)]
        content_type: Option<String>,
        /// Drive the task until it finishes
        #[arg(long)]
        wait: bool,
    },
    /// Query a task (advances polled tasks by one step)
    Status { task_id: String },
    /// Print every task record
    List,
    /// Export the store as a backup document
    Backup {
        /// Output path (default: stdout)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Fail run-to-completion tasks that were interrupted by a restart
    Recover,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let settings = kv_restore::config::load_or_default(args.config.as_deref())?.settings()?;
    kv_restore::logging::init(&settings.logging, args.verbose);

    match args.cmd {
        Command::Restore {
            file,
            content_type,
            wait,
        } => cmd_restore(&settings, &file, content_type.as_deref(), wait),
        Command::Status { task_id } => {
            let r = restorer(&settings, Arc::new(NullSink))?;
            print_record(&r.get_status(&task_id)?)
        }
        Command::List => cmd_list(&settings),
        Command::Backup { out } => cmd_backup(&settings, out.as_deref()),
        Command::Recover => {
            let r = restorer(&settings, Arc::new(StdoutSink::default()))?;
            let ids = r.recover_interrupted()?;
            if ids.is_empty() {
                println!("no interrupted tasks");
            }
            for id in ids {
                println!("failed: {id}");
            }
            Ok(())
        }
    }
}

fn restorer(settings: &Settings, sink: Arc<dyn EventSink>) -> Result<Restorer> {
    let store = kv_restore::kv::open_store(&settings.store)?;
    Ok(Restorer::new(store, settings.restore.clone(), sink))
}

fn guess_content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("txt") => "text/plain",
        _ => "application/json",
    }
}

fn cmd_restore(
    settings: &Settings,
    file: &Path,
    content_type: Option<&str>,
    wait: bool,
) -> Result<()> {
    let body = std::fs::read(file)
        .map_err(|e| kv_restore::Error::msg(format!("failed to read {}: {e}", file.display())))?;
    let ct = content_type.unwrap_or_else(|| guess_content_type(file));
    let snapshot = kv_restore::decode::decode_payload(ct, &body)?;

    let r = restorer(settings, Arc::new(StdoutSink::default()))?;
    let created = r.create_restore(snapshot)?;
    println!(
        "task {} files={} settings={}",
        created.task_id, created.total_files, created.total_settings
    );
    if wait {
        let rec = r.drive_to_completion(&created.task_id)?;
        println!("{}", rec.summary());
    }
    Ok(())
}

fn cmd_list(settings: &Settings) -> Result<()> {
    let r = restorer(settings, Arc::new(NullSink))?;
    let tasks = r.list_tasks()?;
    if tasks.is_empty() {
        println!("no tasks");
    }
    for t in tasks {
        println!(
            "{:<40} {:<22} {:>3}%  {}",
            t.id,
            t.status,
            t.progress,
            t.created_at.to_rfc3339()
        );
    }
    Ok(())
}

fn cmd_backup(settings: &Settings, out: Option<&Path>) -> Result<()> {
    let store = kv_restore::kv::open_store(&settings.store)?;
    let opts = ExportOptions {
        restore_prefix: settings.restore.key_prefix.clone(),
        ..Default::default()
    };
    let snapshot = export_snapshot(store.as_ref(), &opts)?;
    let text = serde_json::to_string_pretty(&snapshot.to_document())?;
    match out {
        Some(p) => {
            std::fs::write(p, text)?;
            println!(
                "wrote {} ({} files, {} settings)",
                p.display(),
                snapshot.total_files(),
                snapshot.total_settings()
            );
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn print_record(rec: &TaskRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(rec)?);
    Ok(())
}
