//! The unified lifecycle manager.
//!
//! All state sits behind one `RwLock`. Queries take the read lock.
//! Transitions take the write lock for their whole duration, adapter calls
//! included, so at most one engine instance is ever being built or torn down.
//! Reading, detecting and injecting a new document happens before the
//! running engine is touched: a bad document never stops a good engine.

use crate::lifecycle::{validate_transition, ManagerState};
use crate::ports::resolve_ports;
use crate::registry::EngineRegistry;
use crate::CoreError;
use corehub_runtime::{CancellationToken, RuntimeError};
use corehub_schema::{
    detect_unwrapped, injector_for, parse_document, read_config_file, unwrap_document,
    ConfigFormat, ControlPorts, Detection, DetectionSource, EngineType, EngineVariant,
    InjectParams, InjectedConfig, SchemaError,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between the stop and start halves of a restart.
const RESTART_PAUSE: Duration = Duration::from_millis(100);

/// Point-in-time view of a manager, serializable for hosts and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub engine_type: EngineType,
    pub engine_name: String,
    pub variant: Option<EngineVariant>,
    pub running: bool,
    pub engine_alive: bool,
    pub socks_port: Option<u16>,
    pub api_port: Option<u16>,
    pub config_path: Option<PathBuf>,
    pub config_format: Option<ConfigFormat>,
    pub log_file: Option<PathBuf>,
    pub asset_path: Option<PathBuf>,
    pub log_level: String,
    pub backend: String,
}

#[derive(Debug)]
struct ManagerInner {
    state: ManagerState,
    core_type: EngineType,
    /// Set once a type was chosen explicitly; used when detection fails.
    type_pinned: bool,
    ports: ControlPorts,
    config_path: Option<PathBuf>,
    variant: Option<EngineVariant>,
    config_format: Option<ConfigFormat>,
    log_file: Option<PathBuf>,
    asset_path: Option<PathBuf>,
    log_level: String,
    token: Option<CancellationToken>,
}

impl Default for ManagerInner {
    fn default() -> Self {
        Self {
            state: ManagerState::Stopped,
            core_type: EngineType::Xray,
            type_pinned: false,
            ports: ControlPorts::default(),
            config_path: None,
            variant: None,
            config_format: None,
            log_file: None,
            asset_path: None,
            log_level: "info".to_owned(),
            token: None,
        }
    }
}

/// A fully prepared run, computed without touching manager state.
struct RunPlan {
    engine: EngineType,
    variant: EngineVariant,
    format: ConfigFormat,
    config: InjectedConfig,
}

pub struct LifecycleManager {
    registry: Arc<EngineRegistry>,
    inner: RwLock<ManagerInner>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        Self {
            registry,
            inner: RwLock::new(ManagerInner::default()),
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    fn read(&self) -> RwLockReadGuard<'_, ManagerInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ManagerInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // --- transitions ---

    /// Start the engine `path` targets, replacing whatever is running.
    pub fn run_config(&self, path: &Path) -> Result<(), CoreError> {
        let mut inner = self.write();
        self.run_locked(&mut inner, path, None)
    }

    /// Like [`run_config`](Self::run_config), but only while an engine runs.
    pub fn update_config(&self, path: &Path) -> Result<(), CoreError> {
        let mut inner = self.write();
        if !inner.state.is_running() {
            return Err(CoreError::NotRunning);
        }
        self.run_locked(&mut inner, path, None)
    }

    /// Stop the running engine. A no-op when stopped.
    ///
    /// The manager is `Stopped` afterwards even when the engine did not stop
    /// cleanly; that case is reported as `EngineStop`.
    pub fn stop(&self) -> Result<(), CoreError> {
        let mut inner = self.write();
        self.stop_locked(&mut inner)
    }

    /// Stop, pause briefly, and run the last document again on the same
    /// engine.
    pub fn restart(&self) -> Result<(), CoreError> {
        let mut inner = self.write();
        let (Some(engine), Some(path)) = (inner.state.engine(), inner.config_path.clone()) else {
            return Err(CoreError::NotRunning);
        };
        info!("restarting {engine} with {}", path.display());
        if let Err(e) = self.stop_locked(&mut inner) {
            warn!("{e}");
        }
        std::thread::sleep(RESTART_PAUSE);
        self.run_locked(&mut inner, &path, Some(engine))
    }

    /// Change the engine family. A running engine is stopped and the same
    /// document is started again on the new family.
    pub fn switch_type(&self, engine: EngineType) -> Result<(), CoreError> {
        let mut inner = self.write();
        let previous = if inner.state.is_running() {
            let path = inner.config_path.clone();
            if let Err(e) = self.stop_locked(&mut inner) {
                warn!("{e}");
            }
            path
        } else {
            None
        };

        info!("switching engine type {} -> {engine}", inner.core_type);
        inner.core_type = engine;
        inner.type_pinned = true;

        match previous {
            Some(path) => self.run_locked(&mut inner, &path, Some(engine)),
            None => Ok(()),
        }
    }

    /// Detect, inject and validate `path` without touching manager state.
    pub fn test_config(&self, path: &Path) -> Result<(), CoreError> {
        let plan = {
            let inner = self.read();
            self.plan(&inner, path, None)?
        };
        let adapter = self.registry.adapter(plan.engine)?;
        adapter
            .validate_only(&plan.config)
            .map_err(|source| CoreError::EngineValidation {
                engine: plan.engine,
                source,
            })?;
        info!("{} accepted {}", plan.engine, path.display());
        Ok(())
    }

    /// Classify a document without touching manager state.
    pub fn detect_file(&self, path: &Path) -> Result<Detection, CoreError> {
        let raw = read_config_file(path)?;
        let (doc, _) = parse_document(&raw)?;
        let unwrapped = unwrap_document(doc)?;
        match detect_unwrapped(&unwrapped) {
            Err(SchemaError::UndetectableConfig) => {
                let inner = self.read();
                if inner.type_pinned {
                    Ok(pinned_detection(inner.core_type))
                } else {
                    Err(CoreError::UndetectableConfig)
                }
            }
            other => other.map_err(CoreError::from),
        }
    }

    // --- setters ---

    pub fn set_core_type(&self, engine: EngineType) -> Result<(), CoreError> {
        let mut inner = self.write();
        if inner.state.is_running() {
            return Err(CoreError::InvalidStateTransition {
                from: inner.state.to_string(),
                to: format!("set core type {engine}"),
            });
        }
        inner.core_type = engine;
        inner.type_pinned = true;
        debug!("core type set to {engine}");
        Ok(())
    }

    pub fn set_ports(&self, socks: u16, api: u16) -> Result<(), CoreError> {
        let mut inner = self.write();
        if inner.state.is_running() {
            return Err(CoreError::InvalidStateTransition {
                from: inner.state.to_string(),
                to: format!("set ports {socks}/{api}"),
            });
        }
        if socks == 0 || api == 0 {
            return Err(CoreError::InvalidPortRange(format!(
                "ports must be in 1..=65535 (got {socks}/{api})"
            )));
        }
        if socks == api {
            return Err(CoreError::InvalidPortRange(format!(
                "socks and api ports must differ (both {socks})"
            )));
        }
        inner.ports = ControlPorts::new(socks, api);
        debug!("ports set to socks={socks} api={api}");
        Ok(())
    }

    /// Takes effect on the next run.
    pub fn set_asset_path(&self, path: Option<PathBuf>) {
        self.write().asset_path = path;
    }

    /// Takes effect on the next run.
    pub fn set_log_level(&self, level: &str) {
        self.write().log_level = level.trim().to_owned();
    }

    // --- queries ---

    /// Whether the manager is in the running state. An engine that exits on
    /// its own does not flip this; `get_stats().engine_alive` reports that.
    pub fn is_running(&self) -> bool {
        self.read().state.is_running()
    }

    pub fn state(&self) -> ManagerState {
        self.read().state
    }

    pub fn get_core_type(&self) -> EngineType {
        self.read().core_type
    }

    pub fn get_ports(&self) -> ControlPorts {
        self.read().ports
    }

    pub fn get_stats(&self) -> ManagerStats {
        let inner = self.read();
        let engine_alive = self
            .registry
            .adapter(inner.core_type)
            .is_ok_and(|a| a.is_running());
        ManagerStats {
            engine_type: inner.core_type,
            engine_name: inner.core_type.display_name().to_owned(),
            variant: inner.variant,
            running: inner.state.is_running(),
            engine_alive,
            socks_port: inner.ports.socks,
            api_port: inner.ports.api,
            config_path: inner.config_path.clone(),
            config_format: inner.config_format,
            log_file: inner.log_file.clone(),
            asset_path: inner.asset_path.clone(),
            log_level: inner.log_level.clone(),
            backend: self.registry.backend().to_owned(),
        }
    }

    // --- internals ---

    fn select_engine(
        inner: &ManagerInner,
        detection: Result<Detection, SchemaError>,
        forced: Option<EngineType>,
    ) -> Result<(EngineType, EngineVariant), CoreError> {
        if let Some(engine) = forced {
            let variant = match detection {
                Ok(d) if d.engine == engine => d.variant,
                _ => engine.default_variant(),
            };
            return Ok((engine, variant));
        }
        match detection {
            Ok(d) => Ok((d.engine, d.variant)),
            Err(SchemaError::UndetectableConfig) if inner.type_pinned => {
                debug!(
                    "document is undetectable; using pinned type {}",
                    inner.core_type
                );
                Ok((inner.core_type, inner.core_type.default_variant()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn plan(
        &self,
        inner: &ManagerInner,
        path: &Path,
        forced: Option<EngineType>,
    ) -> Result<RunPlan, CoreError> {
        let raw = read_config_file(path)?;
        let (doc, format) = parse_document(&raw)?;
        let unwrapped = unwrap_document(doc)?;
        let (engine, variant) = Self::select_engine(inner, detect_unwrapped(&unwrapped), forced)?;

        let injector = injector_for(engine);
        let requested = injector.extract_ports(&unwrapped)?;
        let (socks_port, api_port) = resolve_ports(engine, requested, inner.ports)?;
        let params = InjectParams {
            socks_port,
            api_port,
            asset_dir: inner.asset_path.clone(),
            log_level: inner.log_level.clone(),
        };
        let config = injector.prepare_unwrapped(unwrapped, &params)?;
        debug!(
            "planned {engine} ({variant}) run from {} on socks={socks_port} api={api_port}",
            path.display()
        );
        Ok(RunPlan {
            engine,
            variant,
            format,
            config,
        })
    }

    fn run_locked(
        &self,
        inner: &mut ManagerInner,
        path: &Path,
        forced: Option<EngineType>,
    ) -> Result<(), CoreError> {
        let plan = self.plan(inner, path, forced)?;
        let adapter = self.registry.adapter(plan.engine)?;

        if inner.state.is_running() {
            if let Err(e) = self.stop_locked(inner) {
                warn!("{e}");
            }
        }
        let target = ManagerState::Running(plan.engine);
        validate_transition(inner.state, target)?;

        let token = CancellationToken::new();
        if let Err(source) = adapter.start(&plan.config, token.clone()) {
            token.cancel();
            // The slot belongs to another manager's instance; leave it be.
            if matches!(source, RuntimeError::AlreadyRunning(_)) {
                return Err(CoreError::AlreadyRunning(plan.engine));
            }
            if let Err(e) = adapter.stop() {
                warn!("cleanup after failed {} start: {e}", plan.engine);
            }
            return Err(CoreError::EngineStart {
                engine: plan.engine,
                source,
            });
        }

        inner.state = target;
        inner.core_type = plan.engine;
        inner.ports = plan.config.ports;
        inner.config_path = Some(path.to_path_buf());
        inner.variant = Some(plan.variant);
        inner.config_format = Some(plan.format);
        inner.log_file = plan.config.log_file.clone();
        inner.token = Some(token);
        info!(
            "{} running (socks {}, api {}) from {}",
            plan.engine,
            plan.config.socks_port(),
            plan.config.api_port(),
            path.display()
        );
        Ok(())
    }

    fn stop_locked(&self, inner: &mut ManagerInner) -> Result<(), CoreError> {
        let Some(engine) = inner.state.engine() else {
            debug!("stop requested while stopped");
            return Ok(());
        };
        validate_transition(inner.state, ManagerState::Stopped)?;

        if let Some(token) = inner.token.take() {
            token.cancel();
        }
        let result = self.registry.adapter(engine).and_then(|adapter| {
            adapter
                .stop()
                .map_err(|source| CoreError::EngineStop { engine, source })
        });

        inner.state = ManagerState::Stopped;
        inner.config_path = None;
        inner.variant = None;
        inner.config_format = None;
        inner.log_file = None;
        info!("{engine} stopped");
        result
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state.is_running() {
            if let Some(engine) = inner.state.engine() {
                debug!("manager dropped while {engine} runs; stopping it");
            }
            let mut taken = std::mem::take(inner);
            if let Err(e) = self.stop_locked(&mut taken) {
                warn!("{e}");
            }
        }
    }
}

fn pinned_detection(engine: EngineType) -> Detection {
    Detection {
        engine,
        variant: engine.default_variant(),
        source: DetectionSource::Pinned,
    }
}
