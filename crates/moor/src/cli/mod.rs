//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::Result;
use moor_store::{ImageReference, LocalStore, StoreOptions};

use crate::filesystem::{OverlayFs, RecursiveBind};
use crate::session::{MountRequest, MountSession, UnmountRequest};

/// Moor - Staged OCI image mounting
#[derive(Parser)]
#[command(name = "moor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Graph root holding images and layers
    #[arg(short = 'g', long, global = true, env = "MOOR_GRAPH_ROOT")]
    pub graph: Option<PathBuf>,

    /// Run root holding mount state
    #[arg(short = 'R', long, global = true, env = "MOOR_RUN_ROOT")]
    pub run: Option<PathBuf>,

    /// Graph driver (overlay, vfs)
    #[arg(short = 's', long, global = true, env = "MOOR_STORAGE_DRIVER")]
    pub storage_driver: Option<String>,

    /// Log verbosity on stderr
    #[arg(short = 'l', long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub level: LogLevel,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log verbosity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Errors only
    Error,
    /// Errors and warnings
    Warn,
    /// Normal operation
    Info,
    /// Internal steps
    Debug,
    /// Everything
    Trace,
}

impl LogLevel {
    /// The filter directive matching this verbosity.
    #[must_use]
    pub fn directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Mount commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Mount an image from the local store
    Mount {
        /// Image reference ([registry/]name[:tag])
        image: String,

        /// Stack a writable overlay over the image
        #[arg(short, long)]
        overlay: bool,

        /// Bind the mounted view to this existing directory
        #[arg(short, long)]
        bind: Option<PathBuf>,
    },

    /// Unmount a previously mounted image
    Umount {
        /// Image reference ([registry/]name[:tag])
        image: String,

        /// Merge directory of the overlay to tear down
        #[arg(long)]
        overlay: Option<PathBuf>,

        /// Bind destination to remove
        #[arg(long)]
        bind: Option<PathBuf>,

        /// Release every reference, not just this one
        #[arg(short, long)]
        force: bool,
    },

    /// Run a command in new user and mount namespaces
    Unshare {
        /// Command to run (defaults to $SHELL)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        let options = self.store_options();

        match self.command {
            Commands::Mount {
                image,
                overlay,
                bind,
            } => {
                let reference = ImageReference::parse(&image)?;
                let store = LocalStore::open(options)?;
                let overlay_fs = OverlayFs::default();
                let bind_linker = RecursiveBind;
                let session = MountSession::new(&store, &overlay_fs, &bind_linker);

                let outcome = session.mount(&MountRequest {
                    reference,
                    overlay,
                    bind,
                })?;

                // The only stdout output, one path per completed stage.
                for path in outcome.paths() {
                    println!("{}", path.display());
                }
                Ok(())
            }

            Commands::Umount {
                image,
                overlay,
                bind,
                force,
            } => {
                let reference = ImageReference::parse(&image)?;
                let store = LocalStore::open(options)?;
                let overlay_fs = OverlayFs::default();
                let bind_linker = RecursiveBind;
                let session = MountSession::new(&store, &overlay_fs, &bind_linker);

                session.unmount(&UnmountRequest {
                    reference,
                    overlay,
                    bind,
                    force,
                })?;
                Ok(())
            }

            Commands::Unshare { command } => {
                let code = crate::unshare::run(&command)?;
                if code != 0 {
                    std::process::exit(code);
                }
                Ok(())
            }
        }
    }

    fn store_options(&self) -> StoreOptions {
        let mut options = StoreOptions::auto_detect();
        if let Some(graph) = &self.graph {
            options = options.with_graph_root(graph.clone());
        }
        if let Some(run) = &self.run {
            options = options.with_run_root(run.clone());
        }
        if let Some(driver) = &self.storage_driver {
            options = options.with_graph_driver(driver.clone());
        }
        options
    }
}
