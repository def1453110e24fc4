use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use plugsync_core::View;

#[derive(Parser)]
#[command(name = "plugsync")]
#[command(about = "Install, update and publish plugins from an update site")]
#[command(version)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Base directory (default: ~/.plugsync)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum ViewArg {
    #[default]
    All,
    Installed,
    Uninstalled,
    UpToDate,
    Updateable,
    Official,
    ThirdParty,
}

impl From<ViewArg> for View {
    fn from(view: ViewArg) -> Self {
        match view {
            ViewArg::All => View::All,
            ViewArg::Installed => View::Installed,
            ViewArg::Uninstalled => View::Uninstalled,
            ViewArg::UpToDate => View::UpToDate,
            ViewArg::Updateable => View::Updateable,
            ViewArg::Official => View::Official,
            ViewArg::ThirdParty => View::ThirdParty,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the status of every known file
    Status {
        /// Repository listing (JSON array of records)
        #[arg(short, long)]
        listing: PathBuf,

        /// Structural view to show
        #[arg(long, value_enum, default_value_t = ViewArg::All)]
        view: ViewArg,

        /// Case-insensitive text filter on filename and label
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Apply install/update/remove selections
    Sync {
        /// Repository listing (JSON array of records)
        #[arg(short, long)]
        listing: PathBuf,

        /// Files to install
        #[arg(long, value_delimiter = ',')]
        install: Vec<String>,

        /// Files to update
        #[arg(long, value_delimiter = ',')]
        update: Vec<String>,

        /// Files to remove on next start
        #[arg(long, value_delimiter = ',')]
        remove: Vec<String>,

        /// Queue an update for every updateable file
        #[arg(long)]
        update_all: bool,

        /// Show what would happen without transferring anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Upload local files to the update site
    Publish {
        /// Repository listing (JSON array of records)
        #[arg(short, long)]
        listing: PathBuf,

        /// New catalog database to install as db.xml.gz
        #[arg(short, long)]
        database: PathBuf,

        /// Catalog filenames to upload (e.g., plugins/My_Plugin.jar)
        #[arg(required = true)]
        files: Vec<String>,
    },

    /// Print the digest and size of files
    Digest {
        /// Files to digest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key (e.g., install.launchers)
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key (e.g., install.launchers)
        key: String,

        /// Value to set (e.g., "app-linux64,app-win64.exe" or "[app-linux64]")
        value: String,
    },

    /// List all config values
    List,

    /// Show config file path
    Path,

    /// Initialize config file with defaults
    Init,
}
