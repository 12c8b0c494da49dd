//! Core context and event loop.
//!
//! One thread owns the module host and the hotplug reconciler. Device events
//! and the quit request arrive over a channel; idle unload runs off a ticker.
//! After every dispatch the host's deferred unloads are applied and reported
//! back to the reconciler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, select};
use sound_core::{
    AccessProbe, AutoloadRegistry, DeviceEvent, HotplugConfig, HotplugReconciler, ResourceKind,
    SubscriptionSink,
};

use crate::config::DaemonConfig;
use crate::modules::{ModuleHost, ObjectKind};

/// Messages handled by the event loop.
#[derive(Debug)]
pub enum CoreCommand {
    Device(DeviceEvent),
    Quit,
}

pub struct Daemon {
    config: DaemonConfig,
    host: ModuleHost,
    reconciler: Option<HotplugReconciler>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        events: Arc<dyn SubscriptionSink>,
        probe: Box<dyn AccessProbe + Send>,
    ) -> Result<Self> {
        let autoload = Arc::new(AutoloadRegistry::new(events.clone()));
        for entry in &config.autoload {
            let added = autoload
                .add(&entry.name, entry.kind, &entry.module, &entry.args)
                .with_context(|| format!("autoload entry {:?}", entry.name));
            if let Err(e) = added {
                if config.fail {
                    return Err(e);
                }
                tracing::warn!("{e:#}");
            }
        }

        let reconciler = config.hotplug.enabled.then(|| {
            HotplugReconciler::new(
                HotplugConfig {
                    use_tsched: config.hotplug.tsched,
                    dev_dir: config.hotplug.dev_dir.clone(),
                },
                probe,
            )
        });

        Ok(Self {
            host: ModuleHost::new(autoload, events),
            reconciler,
            config,
        })
    }

    #[cfg(test)]
    pub fn host(&self) -> &ModuleHost {
        &self.host
    }

    pub fn reconciler(&self) -> Option<&HotplugReconciler> {
        self.reconciler.as_ref()
    }

    /// Load detected cards, resolve the configured defaults, then apply the
    /// module loading policy.
    pub fn start(&mut self, initial: Vec<DeviceEvent>) {
        if let Some(reconciler) = self.reconciler.as_mut() {
            reconciler.start(initial, &self.host, &self.host);
        }
        self.apply_unloads();

        let defaults = [
            (self.config.default_sink.as_deref(), ResourceKind::Sink),
            (self.config.default_source.as_deref(), ResourceKind::Source),
        ];
        for (name, kind) in defaults {
            let Some(name) = name else {
                continue;
            };
            match self.host.resolve(name, kind) {
                Some(handle) => tracing::info!(name, kind = %kind, handle = %handle, "default resolved"),
                None => tracing::warn!(name, kind = %kind, "default not available"),
            }
        }
        self.apply_unloads();

        if self.config.disallow_module_loading {
            self.host.set_disallow_loading(true);
        }
        for entry in self.host.autoload().list() {
            tracing::debug!(
                name = %entry.name,
                kind = %entry.kind,
                module = %entry.module,
                handle = %entry.handle,
                "autoload entry"
            );
        }
        for module in self.host.modules() {
            tracing::debug!(
                module = %module.handle,
                spec = module.spec,
                args = %module.args,
                auto_unload = module.auto_unload,
                "loaded at startup"
            );
        }
        tracing::info!(
            cards = ?self.host.object_names(ObjectKind::Card),
            "startup complete"
        );
    }

    fn apply_unloads(&mut self) {
        for module in self.host.process_pending_unloads() {
            if let Some(reconciler) = self.reconciler.as_mut() {
                reconciler.on_module_unloaded(module);
            }
        }
    }

    /// Handle one command. Returns `false` when the loop should stop.
    pub fn dispatch(&mut self, cmd: CoreCommand) -> bool {
        match cmd {
            CoreCommand::Device(event) => {
                match self.reconciler.as_mut() {
                    Some(reconciler) => {
                        let outcome = reconciler.process_device(&event, &self.host, &self.host);
                        tracing::debug!(path = %event.path, outcome = ?outcome, "device event");
                    }
                    None => tracing::debug!(path = %event.path, "hotplug disabled; event dropped"),
                }
                self.apply_unloads();
                true
            }
            CoreCommand::Quit => false,
        }
    }

    pub fn tick(&mut self) {
        let idle = Duration::from_secs(self.config.module_idle_time_sec);
        if self.host.unload_idle(idle) > 0 {
            self.apply_unloads();
        }
    }

    /// Run until `Quit` arrives or every sender is gone.
    pub fn run(&mut self, rx: &Receiver<CoreCommand>) {
        let ticker = match self.config.module_idle_time_sec {
            0 => crossbeam_channel::never(),
            secs => crossbeam_channel::tick(Duration::from_secs(secs)),
        };
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(cmd) => {
                        if !self.dispatch(cmd) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.tick(),
            }
        }
        tracing::info!("event loop stopped");
    }

    /// Unload tracked cards, then everything else.
    pub fn shutdown(mut self) {
        if let Some(reconciler) = self.reconciler.as_mut() {
            reconciler.shutdown(&self.host);
        }
        let unloaded = self.host.unload_all();
        self.host.autoload().free();
        tracing::info!(modules = unloaded.len(), "shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    use sound_core::{
        DeviceAction, ModuleLoader, SubscriptionEvent, SubscriptionFacility, SubscriptionKind,
    };

    use crate::config::AutoloadConfig;

    const CARD0: &str = "/devices/pci0000:00/0000:00:1f.3/sound/card0";

    struct AllowAll;

    impl AccessProbe for AllowAll {
        fn is_writable(&self, _path: &Path) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SubscriptionEvent>>,
    }

    impl SubscriptionSink for RecordingSink {
        fn post(&self, event: SubscriptionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn daemon(config: DaemonConfig) -> (Daemon, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let daemon = Daemon::new(config, sink.clone(), Box::new(AllowAll)).expect("daemon");
        (daemon, sink)
    }

    fn card_event(action: Option<DeviceAction>) -> DeviceEvent {
        DeviceEvent::new(action, CARD0)
            .with_property("SOUND_INITIALIZED", "1")
            .with_property("ID_PATH", "pci-0000:00:1f.3")
    }

    fn null_sink_entry(name: &str) -> AutoloadConfig {
        AutoloadConfig {
            name: name.to_string(),
            kind: ResourceKind::Sink,
            module: "module-null-sink".to_string(),
            args: format!("sink_name={name}"),
        }
    }

    #[test]
    fn startup_loads_cards_and_default_sink() {
        let mut config = DaemonConfig::default();
        config.autoload.push(null_sink_entry("fallback"));
        config.default_sink = Some("fallback".to_string());
        let (mut daemon, _) = daemon(config);

        daemon.start(vec![card_event(None)]);

        assert_eq!(
            daemon.host().object_names(ObjectKind::Card),
            vec!["alsa_card.pci-0000_00_1f.3".to_string()]
        );
        assert!(daemon.host().lookup("fallback", ResourceKind::Sink).is_some());
        assert_eq!(daemon.reconciler().expect("hotplug").devices().len(), 1);
    }

    #[test]
    fn remove_event_unloads_card_module() {
        let (mut daemon, sink) = daemon(DaemonConfig::default());
        daemon.start(Vec::new());

        assert!(daemon.dispatch(CoreCommand::Device(card_event(Some(DeviceAction::Change)))));
        assert_eq!(daemon.host().modules().len(), 1);
        assert!(daemon.dispatch(CoreCommand::Device(DeviceEvent::new(
            Some(DeviceAction::Remove),
            CARD0
        ))));

        assert!(daemon.host().modules().is_empty());
        assert!(daemon.host().object_names(ObjectKind::Card).is_empty());
        let events = sink.events.lock().unwrap();
        assert!(events.contains(&SubscriptionEvent::new(
            SubscriptionFacility::Module,
            SubscriptionKind::Remove,
            0
        )));
    }

    #[test]
    fn forced_unload_of_card_module_evicts_record() {
        let (mut daemon, _) = daemon(DaemonConfig::default());
        daemon.start(vec![card_event(None)]);

        let module = daemon.host().modules()[0].handle;
        daemon.host().request_unload(module, true).expect("unload");
        daemon.apply_unloads();

        assert!(daemon.reconciler().expect("hotplug").devices().is_empty());
        assert!(daemon.dispatch(CoreCommand::Device(card_event(Some(DeviceAction::Change)))));
        assert_eq!(daemon.host().modules().len(), 1);
    }

    #[test]
    fn autoload_conflicts_respect_fail_flag() {
        let mut config = DaemonConfig::default();
        config.autoload = vec![null_sink_entry("dup"), null_sink_entry("dup")];
        let sink: Arc<RecordingSink> = Arc::default();
        assert!(Daemon::new(config.clone(), sink.clone(), Box::new(AllowAll)).is_err());

        config.fail = false;
        let daemon = Daemon::new(config, sink, Box::new(AllowAll)).expect("lenient");
        assert_eq!(daemon.host().autoload().len(), 1);
    }

    #[test]
    fn disallow_applies_after_startup() {
        let mut config = DaemonConfig::default();
        config.disallow_module_loading = true;
        let (mut daemon, _) = daemon(config);
        daemon.start(vec![card_event(None)]);
        assert_eq!(daemon.host().modules().len(), 1);

        let second = DeviceEvent::new(None, "/devices/platform/snd/sound/card1")
            .with_property("SOUND_INITIALIZED", "1");
        daemon.dispatch(CoreCommand::Device(second));
        assert_eq!(daemon.host().modules().len(), 1);
    }

    #[test]
    fn hotplug_disabled_drops_device_events() {
        let mut config = DaemonConfig::default();
        config.hotplug.enabled = false;
        let (mut daemon, _) = daemon(config);
        daemon.start(vec![card_event(None)]);

        assert!(daemon.reconciler().is_none());
        daemon.dispatch(CoreCommand::Device(card_event(Some(DeviceAction::Change))));
        assert!(daemon.host().modules().is_empty());
    }

    #[test]
    fn shutdown_releases_bus_so_logger_drains() {
        let bus = crate::events::EventBus::new();
        let mut rx = bus.subscribe();
        let logger = crate::events::spawn_event_logger(&bus).expect("spawn");
        let mut daemon =
            Daemon::new(DaemonConfig::default(), Arc::new(bus), Box::new(AllowAll)).expect("daemon");
        daemon.start(vec![card_event(None)]);

        daemon.shutdown();
        logger.join().expect("logger stops after shutdown");

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        let last = last.expect("notifications");
        assert_eq!(last.facility, SubscriptionFacility::Module);
        assert_eq!(last.kind, SubscriptionKind::Remove);
    }

    #[test]
    fn run_stops_on_quit_and_shutdown_unloads() {
        let (mut daemon, sink) = daemon(DaemonConfig::default());
        daemon.start(Vec::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(CoreCommand::Device(card_event(Some(DeviceAction::Change))))
            .expect("send");
        tx.send(CoreCommand::Quit).expect("send");

        daemon.run(&rx);
        assert_eq!(daemon.host().modules().len(), 1);

        daemon.shutdown();
        let events = sink.events.lock().unwrap();
        let last_card = events
            .iter()
            .rev()
            .find(|e| e.facility == SubscriptionFacility::Card)
            .expect("card event");
        assert_eq!(last_card.kind, SubscriptionKind::Remove);
    }
}
