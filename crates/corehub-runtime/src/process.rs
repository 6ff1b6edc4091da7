//! Child-process drivers for the real `xray` and `mihomo` binaries.

use crate::backend::{MihomoHub, MihomoProfile, XrayCore, XrayInstance};
use crate::logbus::{LogBus, LogEvent, Subscription};
use crate::RuntimeError;
use base64::Engine as _;
use corehub_schema::InjectedConfig;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a freshly spawned engine is watched for an immediate exit.
const STARTUP_WATCH: Duration = Duration::from_millis(300);
/// How long SIGTERM is given before SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(1);
const POLL: Duration = Duration::from_millis(25);

const XRAY_ASSET_ENV: &str = "XRAY_LOCATION_ASSET";
const V2RAY_ASSET_ENV: &str = "V2RAY_LOCATION_ASSET";
const MIHOMO_CONFIG_ENV: &str = "CLASH_CONFIG_STRING";

fn spawn_error(binary: &Path, err: std::io::Error) -> RuntimeError {
    if err.kind() == std::io::ErrorKind::NotFound {
        RuntimeError::EngineUnavailable(binary.display().to_string())
    } else {
        RuntimeError::ExecFailed(format!("failed to spawn {}: {err}", binary.display()))
    }
}

fn feed_stdin(stdin: Option<ChildStdin>, bytes: &[u8]) {
    let Some(mut stdin) = stdin else {
        return;
    };
    // A child that exits early closes its end; its exit status reports why.
    if let Err(e) = stdin.write_all(bytes) {
        debug!("engine stdin closed early: {e}");
    }
}

/// Condense a failed run's output to its last few meaningful lines.
fn summarize(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
    let tail = lines[lines.len().saturating_sub(5)..].join("; ");
    if tail.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {tail}", output.status)
    }
}

fn pump_lines<R, F>(reader: R, name: &str, mut sink: F)
where
    R: Read + Send + 'static,
    F: FnMut(&str) + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name(format!("corehub-{name}-out"))
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) if !line.trim().is_empty() => sink(&line),
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    if let Err(e) = spawned {
        warn!("cannot capture {name} output: {e}");
    }
}

/// Watch a new child for [`STARTUP_WATCH`]; an exit in that window is a
/// failed start.
fn watch_startup(child: &mut Child, label: &str) -> Result<(), RuntimeError> {
    let deadline = Instant::now() + STARTUP_WATCH;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Err(RuntimeError::StartFailed(format!(
                "{label} exited during startup with {status}"
            )));
        }
        thread::sleep(POLL);
    }
    Ok(())
}

fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}: exceeds i32 range"),
        )
    })?;
    // SAFETY: kill() with a valid pid and signal is safe; pid validated via i32::try_from above.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// SIGTERM, a bounded wait, then SIGKILL. Always reaps the child.
pub(crate) fn terminate(child: &mut Child, label: &str) -> Result<(), RuntimeError> {
    if child.try_wait()?.is_some() {
        debug!("{label} already exited");
        return Ok(());
    }
    let pid = child.id();
    debug!("sending SIGTERM to {label} (pid {pid})");
    if let Err(e) = send_signal(pid, libc::SIGTERM) {
        if e.raw_os_error() != Some(libc::ESRCH) {
            return Err(RuntimeError::ExecFailed(format!(
                "failed to send SIGTERM to pid {pid}: {e}"
            )));
        }
        debug!("pid {pid} already exited before SIGTERM");
    }

    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        thread::sleep(POLL);
    }

    warn!("{label} (pid {pid}) did not exit after SIGTERM, sending SIGKILL");
    child.kill()?;
    child.wait()?;
    Ok(())
}

pub struct XrayProcess {
    binary: PathBuf,
}

impl XrayProcess {
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
        }
    }
}

fn xray_command(binary: &Path, config: &InjectedConfig, args: &[&str]) -> Command {
    let mut cmd = Command::new(binary);
    cmd.args(args);
    if let Some(dir) = &config.asset_dir {
        cmd.env(XRAY_ASSET_ENV, dir).env(V2RAY_ASSET_ENV, dir);
    }
    cmd
}

impl XrayCore for XrayProcess {
    fn name(&self) -> &'static str {
        "process"
    }

    fn validate(&self, config: &InjectedConfig) -> Result<(), RuntimeError> {
        let mut child = xray_command(&self.binary, config, &["run", "-test", "-c", "stdin:"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;
        feed_stdin(child.stdin.take(), &config.bytes);
        let output = child.wait_with_output()?;
        if output.status.success() {
            debug!("xray accepted the config");
            Ok(())
        } else {
            Err(RuntimeError::Validation(summarize(&output)))
        }
    }

    fn create(&self, config: &InjectedConfig) -> Result<Box<dyn XrayInstance>, RuntimeError> {
        Ok(Box::new(XrayProcessInstance {
            command: Some(xray_command(&self.binary, config, &["run", "-c", "stdin:"])),
            binary: self.binary.clone(),
            document: config.bytes.clone(),
            child: None,
        }))
    }
}

struct XrayProcessInstance {
    command: Option<Command>,
    binary: PathBuf,
    document: Vec<u8>,
    child: Option<Child>,
}

impl XrayInstance for XrayProcessInstance {
    fn start(&mut self) -> Result<(), RuntimeError> {
        let Some(mut command) = self.command.take() else {
            return Err(RuntimeError::AlreadyRunning("xray process".to_owned()));
        };
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;
        debug!("spawned xray (pid {})", child.id());

        feed_stdin(child.stdin.take(), &self.document);
        if let Some(out) = child.stdout.take() {
            pump_lines(out, "xray", |line| debug!("xray: {line}"));
        }
        if let Some(err) = child.stderr.take() {
            pump_lines(err, "xray", |line| warn!("xray: {line}"));
        }

        if let Err(e) = watch_startup(&mut child, "xray") {
            let _ = child.wait();
            return Err(e);
        }
        self.child = Some(child);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        match self.child.take() {
            Some(mut child) => terminate(&mut child, "xray"),
            None => Ok(()),
        }
    }
}

impl Drop for XrayProcessInstance {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to terminate xray: {e}");
        }
    }
}

pub struct MihomoProcess {
    binary: PathBuf,
    bus: Arc<LogBus>,
    generation: AtomicU64,
    child: Mutex<Option<(u64, Child)>>,
}

impl MihomoProcess {
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
            bus: Arc::new(LogBus::new()),
            generation: AtomicU64::new(0),
            child: Mutex::new(None),
        }
    }

    fn command(&self, document: &[u8], home: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-d")
            .arg(home)
            .env(
                MIHOMO_CONFIG_ENV,
                base64::engine::general_purpose::STANDARD.encode(document),
            )
            .stdin(Stdio::null());
        cmd
    }

    fn child(&self) -> MutexGuard<'_, Option<(u64, Child)>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MihomoHub for MihomoProcess {
    fn name(&self) -> &'static str {
        "process"
    }

    fn parse(&self, config: &InjectedConfig, home: &Path) -> Result<MihomoProfile, RuntimeError> {
        let output = self
            .command(&config.bytes, home)
            .arg("-t")
            .output()
            .map_err(|e| spawn_error(&self.binary, e))?;
        if !output.status.success() {
            return Err(RuntimeError::Validation(summarize(&output)));
        }
        debug!("mihomo accepted the config");
        Ok(MihomoProfile {
            document: config.bytes.clone(),
            home: home.to_path_buf(),
            ports: config.ports,
            log_level: config.log_level.clone(),
        })
    }

    fn apply(&self, profile: &MihomoProfile) -> Result<u64, RuntimeError> {
        let mut current = self.child();
        if let Some((_, mut previous)) = current.take() {
            debug!("replacing the running mihomo process");
            terminate(&mut previous, "mihomo")?;
        }

        let mut child = self
            .command(&profile.document, &profile.home)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;
        debug!("spawned mihomo (pid {})", child.id());

        for stream in [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        ]
        .into_iter()
        .flatten()
        {
            let bus = Arc::clone(&self.bus);
            pump_lines(stream, "mihomo", move |line| {
                let event = LogEvent::parse_line(line);
                debug!("mihomo [{}] {}", event.level, event.payload);
                bus.publish(&event);
            });
        }

        if let Err(e) = watch_startup(&mut child, "mihomo") {
            let _ = child.wait();
            return Err(e);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *current = Some((generation, child));
        Ok(generation)
    }

    fn shutdown(&self, generation: u64) -> Result<(), RuntimeError> {
        let mut current = self.child();
        match current.as_ref().map(|(owner, _)| *owner) {
            Some(owner) if owner == generation => match current.take() {
                Some((_, mut child)) => terminate(&mut child, "mihomo"),
                None => Ok(()),
            },
            Some(owner) => {
                debug!("mihomo generation {generation} superseded by {owner}");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn is_alive(&self) -> bool {
        self.child()
            .as_mut()
            .is_some_and(|(_, child)| matches!(child.try_wait(), Ok(None)))
    }

    fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    fn unsubscribe(&self, id: u64) {
        self.bus.unsubscribe(id);
    }
}

impl Drop for MihomoProcess {
    fn drop(&mut self) {
        let Some((_, mut child)) = self.child().take() else {
            return;
        };
        if let Err(e) = terminate(&mut child, "mihomo") {
            warn!("failed to terminate mihomo: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corehub_schema::{injector_for, EngineType, InjectParams};

    fn prepared(engine: EngineType) -> InjectedConfig {
        injector_for(engine)
            .prepare(b"{}", &InjectParams::new(24101, 24102))
            .unwrap()
    }

    #[test]
    fn missing_binary_is_reported_as_unavailable() {
        let core = XrayProcess::new(Path::new("/nonexistent/corehub-test-xray"));
        let err = core.validate(&prepared(EngineType::Xray)).unwrap_err();
        assert!(matches!(err, RuntimeError::EngineUnavailable(ref b) if b.contains("corehub-test-xray")));

        let mut instance = core.create(&prepared(EngineType::Xray)).unwrap();
        assert!(matches!(
            instance.start(),
            Err(RuntimeError::EngineUnavailable(_))
        ));
        assert!(!instance.is_alive());
    }

    #[test]
    fn missing_mihomo_binary_is_reported_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let hub = MihomoProcess::new(Path::new("/nonexistent/corehub-test-mihomo"));
        let err = hub
            .parse(&prepared(EngineType::Mihomo), dir.path())
            .unwrap_err();
        assert!(matches!(err, RuntimeError::EngineUnavailable(_)));
        assert!(!hub.is_alive());
        hub.shutdown(1).unwrap();
    }

    #[test]
    fn failing_validation_surfaces_output() {
        // `false` ignores its arguments and exits non-zero.
        let core = XrayProcess::new(Path::new("false"));
        let err = core.validate(&prepared(EngineType::Xray)).unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(ref m) if m.contains("exited with")));
    }

    #[test]
    fn early_exit_is_a_failed_start() {
        let core = XrayProcess::new(Path::new("true"));
        let mut instance = core.create(&prepared(EngineType::Xray)).unwrap();
        assert!(matches!(instance.start(), Err(RuntimeError::StartFailed(_))));
    }

    #[test]
    fn terminate_stops_a_long_running_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let start = Instant::now();
        terminate(&mut child, "sleep").unwrap();
        assert!(child.try_wait().unwrap().is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn summarize_keeps_the_tail() {
        let output = Command::new("sh")
            .args(["-c", "for i in 1 2 3 4 5 6 7; do echo line$i >&2; done; exit 3"])
            .output()
            .unwrap();
        let summary = summarize(&output);
        assert!(summary.contains("line7"));
        assert!(!summary.contains("line1;"));
    }
}
