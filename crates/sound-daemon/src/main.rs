//! sound-daemon: sound card hotplug and module autoload service.
//!
//! ## Startup
//! 1. Load configuration and install logging.
//! 2. Subscribe the udev monitor, then enumerate cards already present, so
//!    nothing that changes in between is missed.
//! 3. Load a card module per detected card and resolve the default sink and
//!    source (which may autoload them).
//! 4. Run the event loop until SIGINT/SIGTERM, then unload everything.
//!
//! ## Commands
//! - `run` (default): run the daemon.
//! - `dump-conf`: print the effective configuration.
//! - `dump-modules [NAME...]`: list the module catalog.

mod cli;
mod config;
mod daemon;
mod events;
mod modules;
mod monitor;
mod sysfs;

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Command;
use crate::config::{DaemonConfig, LogTarget};
use crate::daemon::{CoreCommand, Daemon};
use crate::events::EventBus;
use crate::monitor::CardTranslator;
use crate::sysfs::{SysfsLayout, WriteAccessProbe};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    let loaded = config::load_config(args.config.as_deref())?;
    let mut cfg = loaded.config;
    args.apply_overrides(&mut cfg);
    init_tracing(&cfg);

    match args.cmd.unwrap_or(Command::Run) {
        Command::DumpConf => {
            print!("{}", config::dump_conf(&cfg, loaded.source.as_deref())?);
        }
        Command::DumpModules { names } => {
            print!("{}", modules::format_module_list(&names, cfg.verbose)?);
        }
        Command::Run => {
            if let Some(path) = loaded.source.as_deref() {
                tracing::info!(path = %path.display(), "configuration loaded");
            }
            run(cfg)?;
        }
    }
    Ok(())
}

fn init_tracing(cfg: &DaemonConfig) {
    let default = if cfg.verbose {
        "debug,sound_daemon=debug,sound_core=debug"
    } else {
        "info,sound_daemon=info,sound_core=info"
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr);
    match cfg.log_target {
        LogTarget::Json => builder.json().init(),
        LogTarget::Stderr => builder.with_ansi(false).init(),
        LogTarget::Auto => builder.with_ansi(std::io::stderr().is_terminal()).init(),
    }
}

fn run(cfg: DaemonConfig) -> Result<()> {
    let bus = EventBus::new();
    let logger = events::spawn_event_logger(&bus).context("spawn event logger")?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let quit_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = quit_tx.send(CoreCommand::Quit);
    })
    .context("install signal handler")?;

    let mut daemon = Daemon::new(cfg.clone(), Arc::new(bus), Box::new(WriteAccessProbe))?;

    let mut initial = Vec::new();
    let _watcher = if cfg.hotplug.enabled {
        let layout = SysfsLayout::from(&cfg.hotplug);
        let translator = Arc::new(CardTranslator::new(layout.clone()));
        let watcher = monitor::spawn_monitor(translator.clone(), tx)?;
        initial = translator.enumerate()?;
        Some(watcher)
    } else {
        drop(tx);
        None
    };

    daemon.start(initial);
    tracing::info!(
        cards = daemon.reconciler().map_or(0, |r| r.devices().len()),
        "daemon ready"
    );
    daemon.run(&rx);
    daemon.shutdown();
    logger
        .join()
        .map_err(|_| anyhow::anyhow!("event logger panicked"))?;
    Ok(())
}
