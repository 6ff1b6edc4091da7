//! In-process engine drivers for tests and dry runs.
//!
//! Mock engines bind real loopback listeners on the injected ports, so port
//! ownership behaves like it does with the real binaries. A shared
//! [`MockControl`] injects failures and counts live instances across both
//! families.

use crate::backend::{MihomoHub, MihomoProfile, XrayCore, XrayInstance};
use crate::logbus::{LogBus, LogEvent, LogLevel, Subscription};
use crate::RuntimeError;
use corehub_schema::{ControlPorts, InjectedConfig};
use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MockControl {
    fail_validation: AtomicBool,
    fail_start: AtomicBool,
    panic_on_start: AtomicBool,
    close_delay_ms: AtomicU64,
    live: AtomicUsize,
    max_live: AtomicUsize,
    starts: AtomicUsize,
}

impl MockControl {
    pub fn set_fail_validation(&self, on: bool) {
        self.fail_validation.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, on: bool) {
        self.fail_start.store(on, Ordering::SeqCst);
    }

    pub fn set_panic_on_start(&self, on: bool) {
        self.panic_on_start.store(on, Ordering::SeqCst);
    }

    /// Make every teardown block for `delay` first.
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Instances currently holding their listeners.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live instances seen so far.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Successful starts so far.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn check_validation(&self) -> Result<(), RuntimeError> {
        if self.fail_validation.load(Ordering::SeqCst) {
            return Err(RuntimeError::Validation(
                "mock engine rejected the config".to_owned(),
            ));
        }
        Ok(())
    }

    fn check_start(&self) -> Result<(), RuntimeError> {
        if self.panic_on_start.load(Ordering::SeqCst) {
            panic!("mock engine panicked during start");
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::StartFailed(
                "mock engine refused to start".to_owned(),
            ));
        }
        Ok(())
    }

    fn close_delay(&self) {
        let ms = self.close_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

/// Whether `port` can currently be bound on loopback.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Two distinct loopback ports that were free a moment ago.
pub fn free_port_pair() -> std::io::Result<(u16, u16)> {
    let a = TcpListener::bind("127.0.0.1:0")?;
    let b = TcpListener::bind("127.0.0.1:0")?;
    Ok((a.local_addr()?.port(), b.local_addr()?.port()))
}

/// Listeners owned by one live mock instance.
#[derive(Debug)]
struct MockListeners {
    _listeners: Vec<TcpListener>,
    control: Arc<MockControl>,
}

impl MockListeners {
    fn bind(ports: ControlPorts, control: &Arc<MockControl>) -> Result<Self, RuntimeError> {
        let mut listeners = Vec::new();
        for port in [ports.socks, ports.api].into_iter().flatten() {
            let listener = TcpListener::bind(("127.0.0.1", port)).map_err(|e| {
                RuntimeError::StartFailed(format!("cannot listen on 127.0.0.1:{port}: {e}"))
            })?;
            listeners.push(listener);
        }
        let live = control.live.fetch_add(1, Ordering::SeqCst) + 1;
        control.max_live.fetch_max(live, Ordering::SeqCst);
        control.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            _listeners: listeners,
            control: Arc::clone(control),
        })
    }
}

impl Drop for MockListeners {
    fn drop(&mut self) {
        self.control.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockXrayCore {
    control: Arc<MockControl>,
}

impl Default for MockXrayCore {
    fn default() -> Self {
        Self::with_control(Arc::new(MockControl::default()))
    }
}

impl MockXrayCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control(control: Arc<MockControl>) -> Self {
        Self { control }
    }
}

impl XrayCore for MockXrayCore {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn validate(&self, config: &InjectedConfig) -> Result<(), RuntimeError> {
        self.control.check_validation()?;
        let doc: serde_json::Value = serde_json::from_slice(&config.bytes)
            .map_err(|e| RuntimeError::Validation(format!("invalid JSON: {e}")))?;
        if !doc.get("inbounds").is_some_and(serde_json::Value::is_array) {
            return Err(RuntimeError::Validation(
                "config has no inbounds list".to_owned(),
            ));
        }
        Ok(())
    }

    fn create(&self, config: &InjectedConfig) -> Result<Box<dyn XrayInstance>, RuntimeError> {
        self.validate(config)?;
        Ok(Box::new(MockXrayInstance {
            control: Arc::clone(&self.control),
            ports: config.ports,
            listeners: None,
        }))
    }
}

struct MockXrayInstance {
    control: Arc<MockControl>,
    ports: ControlPorts,
    listeners: Option<MockListeners>,
}

impl XrayInstance for MockXrayInstance {
    fn start(&mut self) -> Result<(), RuntimeError> {
        if self.listeners.is_some() {
            return Err(RuntimeError::AlreadyRunning("mock xray".to_owned()));
        }
        self.control.check_start()?;
        self.listeners = Some(MockListeners::bind(self.ports, &self.control)?);
        debug!("mock xray listening on {:?}", self.ports);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.listeners.is_some()
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        self.control.close_delay();
        self.listeners = None;
        Ok(())
    }
}

pub struct MockMihomoHub {
    control: Arc<MockControl>,
    bus: LogBus,
    generation: AtomicU64,
    applied: Mutex<Option<(u64, MockListeners)>>,
}

impl Default for MockMihomoHub {
    fn default() -> Self {
        Self::with_control(Arc::new(MockControl::default()))
    }
}

impl MockMihomoHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_control(control: Arc<MockControl>) -> Self {
        Self {
            control,
            bus: LogBus::new(),
            generation: AtomicU64::new(0),
            applied: Mutex::new(None),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    fn applied(&self) -> MutexGuard<'_, Option<(u64, MockListeners)>> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MihomoHub for MockMihomoHub {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn parse(&self, config: &InjectedConfig, home: &Path) -> Result<MihomoProfile, RuntimeError> {
        self.control.check_validation()?;
        let doc: serde_yaml::Value = serde_yaml::from_slice(&config.bytes)
            .map_err(|e| RuntimeError::Validation(format!("invalid YAML: {e}")))?;
        if !doc.is_mapping() {
            return Err(RuntimeError::Validation(
                "config is not a mapping".to_owned(),
            ));
        }
        Ok(MihomoProfile {
            document: config.bytes.clone(),
            home: home.to_path_buf(),
            ports: config.ports,
            log_level: config.log_level.clone(),
        })
    }

    fn apply(&self, profile: &MihomoProfile) -> Result<u64, RuntimeError> {
        self.bus.publish(&LogEvent::new(
            LogLevel::Info,
            "Start initial configuration in progress",
        ));
        if let Err(e) = self.control.check_start() {
            self.bus
                .publish(&LogEvent::new(LogLevel::Error, e.to_string()));
            return Err(e);
        }

        let mut applied = self.applied();
        // Applying replaces the previous configuration and its listeners.
        drop(applied.take());
        let listeners = MockListeners::bind(profile.ports, &self.control)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *applied = Some((generation, listeners));
        self.bus.publish(&LogEvent::new(
            LogLevel::Info,
            format!(
                "configuration applied (mixed-port {})",
                profile.ports.socks.unwrap_or_default()
            ),
        ));
        Ok(generation)
    }

    fn shutdown(&self, generation: u64) -> Result<(), RuntimeError> {
        self.control.close_delay();
        let mut applied = self.applied();
        match applied.as_ref().map(|(owner, _)| *owner) {
            Some(owner) if owner == generation => {
                *applied = None;
                self.bus
                    .publish(&LogEvent::new(LogLevel::Info, "hub shut down"));
            }
            Some(owner) => debug!("mock hub generation {generation} superseded by {owner}"),
            None => {}
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.applied().is_some()
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }
}
