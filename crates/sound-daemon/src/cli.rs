use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{DaemonConfig, LogTarget};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "sound-daemon", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Configuration file (TOML); overrides $SOUND_DAEMON_CONFIG
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging; long form for dump-modules
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Refuse module loads after startup configuration
    #[arg(long)]
    pub disallow_module_loading: bool,

    /// Seconds before an idle auto-unload module is unloaded (0 disables)
    #[arg(long)]
    pub module_idle_time: Option<u64>,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_target: Option<LogTarget>,

    /// Do not watch for sound card hotplug
    #[arg(long)]
    pub no_hotplug: bool,

    /// Disable timer-based scheduling for detected cards
    #[arg(long)]
    pub no_tsched: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon (default)
    Run,
    /// Print the effective configuration and exit
    DumpConf,
    /// List available modules and exit
    DumpModules {
        /// Show details for these modules only
        names: Vec<String>,
    },
}

impl Args {
    /// Apply command line flags on top of the file configuration.
    pub fn apply_overrides(&self, config: &mut DaemonConfig) {
        if self.verbose {
            config.verbose = true;
        }
        if self.disallow_module_loading {
            config.disallow_module_loading = true;
        }
        if let Some(secs) = self.module_idle_time {
            config.module_idle_time_sec = secs;
        }
        if let Some(target) = self.log_target {
            config.log_target = target;
        }
        if self.no_hotplug {
            config.hotplug.enabled = false;
        }
        if self.no_tsched {
            config.hotplug.tsched = false;
        }
    }
}
