use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::{ColoredString, Colorize};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use plugsync_core::config::Config;
use plugsync_core::digest::{Digester, Sha256Digester};
use plugsync_core::repository::{render_manifest, InstallLayout, RepositoryLayout, MANIFEST};
use plugsync_core::worker::{wait, Progress};
use plugsync_core::{
    scan_local, upload_batch, Action, DownloadCoordinator, Downloader, FsTransferEngine,
    PluginCatalog, PluginEntry, PublishCoordinator, Publisher, RemoteRecord, Result,
    SharedCatalog, Status, SyncError, View,
};

mod args;
use args::{Cli, Commands, ConfigAction, Shell, ViewArg};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = resolve_base_dir(cli.base_dir).and_then(|base_dir| match cli.command {
        Some(Commands::Status {
            listing,
            view,
            filter,
        }) => handle_status(&base_dir, &listing, view, filter.as_deref()),
        Some(Commands::Sync {
            listing,
            install,
            update,
            remove,
            update_all,
            dry_run,
        }) => handle_sync(
            &base_dir,
            &listing,
            Selection {
                install,
                update,
                remove,
                update_all,
            },
            dry_run,
            cli.quiet,
        ),
        Some(Commands::Publish {
            listing,
            database,
            files,
        }) => handle_publish(&base_dir, &listing, &database, &files, cli.quiet),
        Some(Commands::Digest { paths }) => handle_digest(&paths),
        Some(Commands::Config { action }) => handle_config(action, &base_dir),
        Some(Commands::Completions { shell }) => {
            handle_completions(shell);
            Ok(())
        }
        None => {
            Cli::command().print_help().ok();
            Ok(())
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red().bold(), e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_env("PLUGSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let shell = match shell {
        Shell::Bash => clap_complete::Shell::Bash,
        Shell::Zsh => clap_complete::Shell::Zsh,
        Shell::Fish => clap_complete::Shell::Fish,
        Shell::PowerShell => clap_complete::Shell::PowerShell,
        Shell::Elvish => clap_complete::Shell::Elvish,
    };
    generate(shell, &mut cmd, "plugsync", &mut io::stdout());
}

fn resolve_base_dir(cli_base: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(base) = cli_base {
        return Ok(base);
    }

    if let Ok(base) = std::env::var("PLUGSYNC_BASE") {
        return Ok(PathBuf::from(base));
    }

    dirs::home_dir()
        .map(|h| h.join(".plugsync"))
        .ok_or(SyncError::HomeNotFound)
}

/// Everything a command needs after reading config, listing and local files
struct Session {
    repository: RepositoryLayout,
    install: InstallLayout,
    catalog: PluginCatalog,
    /// Live database timestamp when the session started
    snapshot: Option<i64>,
}

fn open_session(base_dir: &Path, listing: &Path) -> Result<Session> {
    let config = Config::load(base_dir)?;
    let repository = config.repository_layout()?;
    let install = config.install_layout();
    let snapshot = repository.database_modified()?;

    let remote: Vec<RemoteRecord> = serde_json::from_str(&fs::read_to_string(listing)?)?;
    let local = scan_local(install.root(), install.staging_dir(), &Sha256Digester)?;
    let catalog = PluginCatalog::merge(remote, local, config.catalog_options());
    debug!(entries = catalog.len(), ?snapshot, "session opened");

    Ok(Session {
        repository,
        install,
        catalog,
        snapshot,
    })
}

fn status_tag(status: Status) -> ColoredString {
    let tag = format!("[{}]", status.as_str().to_uppercase());
    match status {
        Status::UpToDate => tag.green(),
        Status::Updateable => tag.cyan(),
        Status::NotInstalled => tag.blue(),
        Status::Orphaned => tag.yellow(),
    }
}

fn print_entry(catalog: &PluginCatalog, entry: &PluginEntry) {
    let mut line = format!("  {} {}", status_tag(entry.status()), entry.filename());
    if let Some(label) = &entry.label {
        line.push_str(&format!(" ({})", label));
    }
    if catalog.is_official(entry) {
        line.push_str(&format!(" {}", "official".dimmed()));
    }
    if entry.pending_action() != Action::None {
        line.push_str(&format!(" -> {}", entry.pending_action().to_string().bold()));
    }
    println!("{}", line);
}

fn handle_status(
    base_dir: &Path,
    listing: &Path,
    view: ViewArg,
    filter: Option<&str>,
) -> Result<()> {
    let session = open_session(base_dir, listing)?;

    println!();
    println!("Repository:   {}", session.repository.base().display());
    println!("Installation: {}", session.install.root().display());
    match session
        .snapshot
        .and_then(chrono::DateTime::from_timestamp_millis)
    {
        Some(at) => println!(
            "Catalog:      updated {}",
            at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("Catalog:      {}", "not published yet".yellow()),
    }
    println!();

    let entries = session
        .catalog
        .search(view.into(), filter.unwrap_or_default());
    if entries.is_empty() {
        println!("No files match.");
        return Ok(());
    }
    for entry in &entries {
        print_entry(&session.catalog, entry);
    }

    println!();
    println!(
        "{} of {} files shown",
        entries.len(),
        session.catalog.len()
    );
    let counts: Vec<String> = View::ALL
        .iter()
        .filter(|v| **v != View::All)
        .map(|v| format!("{}: {}", v.as_str(), session.catalog.view(*v).len()))
        .collect();
    println!("{}", counts.join("  ").dimmed());
    Ok(())
}

struct Selection {
    install: Vec<String>,
    update: Vec<String>,
    remove: Vec<String>,
    update_all: bool,
}

/// Queue `action` on `filename`. Illegal requests are reported and skipped.
fn request(catalog: &mut PluginCatalog, filename: &str, action: Action) -> Result<()> {
    match catalog.set_action(filename, action) {
        Err(e) if e.is_recoverable() => {
            eprintln!("{} {}", "[SKIP]".yellow(), e);
            Ok(())
        }
        other => other,
    }
}

fn render_progress(quiet: bool) -> impl Fn(&Progress) {
    move |p: &Progress| {
        if quiet {
            return;
        }
        let percent = if p.total_bytes == 0 {
            100
        } else {
            p.done_bytes * 100 / p.total_bytes
        };
        eprint!("\r{} {:>3}% {:<60}", "[..]".cyan(), percent, p.item);
        io::stderr().flush().ok();
    }
}

fn finish_progress(quiet: bool) {
    if !quiet {
        eprintln!();
    }
}

fn handle_sync(
    base_dir: &Path,
    listing: &Path,
    selection: Selection,
    dry_run: bool,
    quiet: bool,
) -> Result<()> {
    let Session {
        repository,
        install,
        mut catalog,
        ..
    } = open_session(base_dir, listing)?;

    for filename in &selection.install {
        request(&mut catalog, filename, Action::Install)?;
    }
    for filename in &selection.update {
        request(&mut catalog, filename, Action::Update)?;
    }
    if selection.update_all {
        let updateable: Vec<String> = catalog
            .iter()
            .filter(|e| e.status() == Status::Updateable)
            .map(|e| e.filename().to_string())
            .collect();
        for filename in &updateable {
            request(&mut catalog, filename, Action::Update)?;
        }
    }
    for filename in &selection.remove {
        request(&mut catalog, filename, Action::Remove)?;
    }

    if !catalog.has_pending_changes() {
        println!("Nothing to do.");
        return Ok(());
    }

    let summary = catalog.summary();
    println!();
    println!(
        "Install: {}  Update: {}  Remove: {}",
        summary.install, summary.update, summary.remove
    );
    for entry in catalog.iter().filter(|e| e.pending_action() != Action::None) {
        print_entry(&catalog, entry);
    }
    println!();

    if dry_run {
        println!("{}", "Dry run: nothing transferred.".yellow());
        return Ok(());
    }

    let coordinator = DownloadCoordinator::new(Downloader::new(
        Arc::new(FsTransferEngine),
        repository,
        install,
    ));
    let events = coordinator.start(SharedCatalog::new(catalog))?;
    let outcome = wait(events, Some(&render_progress(quiet)));
    finish_progress(quiet);

    let report = outcome.unwrap_or(Err(SyncError::Transfer {
        message: "download worker exited without a result".to_string(),
    }))?;

    for filename in &report.installed {
        println!("  {} {}", "[OK]".green(), filename);
    }
    for filename in &report.marked_for_removal {
        println!("  {} {}", "[DEL]".red(), filename);
    }
    println!();
    println!("Restart the application to apply the changes.");
    Ok(())
}

fn handle_publish(
    base_dir: &Path,
    listing: &Path,
    database: &Path,
    files: &[String],
    quiet: bool,
) -> Result<()> {
    let Session {
        repository,
        install,
        mut catalog,
        snapshot,
    } = open_session(base_dir, listing)?;

    if catalog.options().publisher.is_none() {
        return Err(SyncError::ConfigValueMissing {
            key: "publisher.name".to_string(),
        });
    }

    for filename in files {
        request(&mut catalog, filename, Action::Upload)?;
    }
    if !catalog.has_pending_uploads() {
        println!("Nothing to publish.");
        return Ok(());
    }

    fs::create_dir_all(base_dir)?;
    let manifest = base_dir.join(MANIFEST);
    fs::write(&manifest, render_manifest(&catalog))?;
    let batch = upload_batch(database, &manifest, &catalog, &install)?;

    println!();
    println!("Uploading to {}", repository.base().display());
    for entry in catalog.to_upload() {
        println!("  {} {}", "[UP]".cyan(), entry.filename());
    }
    println!();

    let coordinator =
        PublishCoordinator::new(Publisher::new(Arc::new(FsTransferEngine), repository));
    let events = coordinator.publish(snapshot, batch)?;
    let outcome = wait(events, Some(&render_progress(quiet)));
    finish_progress(quiet);

    let report = outcome.unwrap_or(Err(SyncError::Transfer {
        message: "publish worker exited without a result".to_string(),
    }))?;

    println!(
        "{} {} files, {} bytes",
        "Published:".green(),
        report.uploaded,
        report.bytes
    );
    if report.backup_created {
        println!("Previous catalog kept as db.bak");
    }
    Ok(())
}

fn handle_digest(paths: &[PathBuf]) -> Result<()> {
    let digester = Sha256Digester;
    for path in paths {
        let name = path.display().to_string();
        let digest = digester.digest(&name, path)?;
        let size = fs::metadata(path)?.len();
        println!("{}  {:>10}  {}", digest, size, name);
    }
    Ok(())
}

fn handle_config(action: ConfigAction, base_dir: &Path) -> Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load(base_dir)?;
            match config.get(&key) {
                Some(value) => {
                    println!("{}", value);
                }
                None => {
                    return Err(SyncError::ConfigKeyNotFound { key });
                }
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load(base_dir)?;
            config.set(&key, &value)?;
            config.save(base_dir)?;
            println!("{} {} = {}", "Set:".green(), key, value);
        }
        ConfigAction::List => {
            let config = Config::load(base_dir)?;
            println!();
            for (key, value) in config.list() {
                println!("{} = {}", key.cyan(), value);
            }
            println!();
        }
        ConfigAction::Path => {
            let path = Config::path(base_dir);
            println!("{}", path.display());
        }
        ConfigAction::Init => {
            let path = Config::init(base_dir)?;
            println!("{} {}", "Initialized:".green(), path.display());
        }
    }

    Ok(())
}
