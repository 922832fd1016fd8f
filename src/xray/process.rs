use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{
    net::TcpStream,
    process::{Child, Command},
    time::Instant,
};
use tracing::{debug, warn};
use ulid::Ulid;

pub use crate::config::ReadinessMode;
use crate::xray::builder::EngineConfig;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub engine_bin: PathBuf,
    /// Parent directory for per-probe working directories.
    pub work_root: PathBuf,
    pub readiness: ReadinessMode,
    pub ready_timeout: Duration,
    pub stop_timeout: Duration,
}

/// Lifecycle of one ephemeral engine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeStage {
    Created,
    ConfigWritten,
    Started,
    AwaitingReady,
    Stopped,
    CleanedUp,
}

impl ProbeStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ConfigWritten => "config_written",
            Self::Started => "started",
            Self::AwaitingReady => "awaiting_ready",
            Self::Stopped => "stopped",
            Self::CleanedUp => "cleaned_up",
        }
    }
}

#[derive(Debug)]
pub enum OrchestrateError {
    PortUnavailable { message: String },
    WorkDir { message: String },
    WriteConfig { message: String },
    EngineNotFound { path: PathBuf },
    Spawn { message: String },
    ExitedEarly { status: String },
    NotReady { waited: Duration },
}

impl std::fmt::Display for OrchestrateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PortUnavailable { message } => write!(f, "allocate local port: {message}"),
            Self::WorkDir { message } => write!(f, "create working dir: {message}"),
            Self::WriteConfig { message } => write!(f, "write engine config: {message}"),
            Self::EngineNotFound { path } => {
                write!(f, "engine binary not found: {}", path.display())
            }
            Self::Spawn { message } => write!(f, "spawn engine: {message}"),
            Self::ExitedEarly { status } => write!(f, "engine exited early: {status}"),
            Self::NotReady { waited } => write!(
                f,
                "engine listener not ready after {}ms",
                waited.as_millis()
            ),
        }
    }
}

impl std::error::Error for OrchestrateError {}

/// Port, working directory and engine process owned by a single probe.
///
/// Dropping the context kills any engine still running and removes the working directory, so
/// every exit path (including cancellation) releases both.
#[derive(Debug)]
pub struct ProbeContext {
    port: u16,
    dir: PathBuf,
    engine: Option<Child>,
    stage: ProbeStage,
}

impl ProbeContext {
    pub fn create(work_root: &Path) -> Result<Self, OrchestrateError> {
        let port = allocate_local_port()?;
        let dir = work_root.join(format!("nodeprobe-{}", Ulid::new()));
        create_private_dir(&dir).map_err(|e| OrchestrateError::WorkDir {
            message: format!("{}: {e}", dir.display()),
        })?;

        Ok(Self {
            port,
            dir,
            engine: None,
            stage: ProbeStage::Created,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stage(&self) -> ProbeStage {
        self.stage
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    pub fn engine_pid(&self) -> Option<u32> {
        self.engine.as_ref().and_then(|c| c.id())
    }

    pub fn write_config(&mut self, config: &EngineConfig) -> Result<(), OrchestrateError> {
        let bytes = config
            .to_vec_pretty()
            .map_err(|e| OrchestrateError::WriteConfig {
                message: e.to_string(),
            })?;
        write_private_file(&self.config_path(), &bytes).map_err(|e| {
            OrchestrateError::WriteConfig {
                message: e.to_string(),
            }
        })?;
        self.stage = ProbeStage::ConfigWritten;
        Ok(())
    }

    pub fn start(&mut self, opts: &EngineOptions) -> Result<(), OrchestrateError> {
        let mut cmd = Command::new(&opts.engine_bin);
        cmd.arg("run")
            .arg("-c")
            .arg(self.config_path())
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchestrateError::EngineNotFound {
                    path: opts.engine_bin.clone(),
                });
            }
            Err(err) => {
                return Err(OrchestrateError::Spawn {
                    message: err.to_string(),
                });
            }
        };

        debug!(pid = child.id(), port = self.port, "engine started");
        self.engine = Some(child);
        self.stage = ProbeStage::Started;
        Ok(())
    }

    /// Waits for the engine's SOCKS listener according to `opts.readiness`.
    pub async fn await_ready(&mut self, opts: &EngineOptions) -> Result<(), OrchestrateError> {
        self.stage = ProbeStage::AwaitingReady;
        let started = Instant::now();

        match opts.readiness {
            ReadinessMode::Sleep => {
                tokio::time::sleep(opts.ready_timeout).await;
                self.ensure_running()
            }
            ReadinessMode::Poll => loop {
                self.ensure_running()?;
                if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                    debug!(
                        port = self.port,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "engine listener ready"
                    );
                    return Ok(());
                }
                if started.elapsed() >= opts.ready_timeout {
                    return Err(OrchestrateError::NotReady {
                        waited: started.elapsed(),
                    });
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            },
        }
    }

    fn ensure_running(&mut self) -> Result<(), OrchestrateError> {
        let Some(child) = self.engine.as_mut() else {
            return Err(OrchestrateError::ExitedEarly {
                status: "not started".to_string(),
            });
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                self.engine = None;
                Err(OrchestrateError::ExitedEarly {
                    status: status.to_string(),
                })
            }
            Err(err) => Err(OrchestrateError::ExitedEarly {
                status: err.to_string(),
            }),
        }
    }

    /// Stops the engine (TERM to its process group, bounded wait, then KILL) and removes the
    /// working directory.
    pub async fn shutdown(mut self, stop_timeout: Duration) {
        if let Some(mut child) = self.engine.take() {
            stop_engine(&mut child, stop_timeout).await;
        }
        self.stage = ProbeStage::Stopped;
        // Drop removes the directory.
    }
}

impl Drop for ProbeContext {
    fn drop(&mut self) {
        if let Some(mut child) = self.engine.take() {
            signal_group(&child, Signal::Kill);
            let _ = child.start_kill();
        }
        if let Err(err) = std::fs::remove_dir_all(&self.dir)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(dir = %self.dir.display(), %err, "remove probe working dir failed");
        }
        self.stage = ProbeStage::CleanedUp;
    }
}

async fn stop_engine(child: &mut Child, stop_timeout: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    signal_group(child, Signal::Term);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    if tokio::time::timeout(stop_timeout, child.wait()).await.is_err() {
        debug!(pid = child.id(), "engine ignored SIGTERM; killing");
        signal_group(child, Signal::Kill);
        let _ = child.kill().await;
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg has no memory-safety preconditions; the group was created for this child.
    unsafe {
        libc::killpg(pgid, sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: Signal) {}

fn allocate_local_port() -> Result<u16, OrchestrateError> {
    // Free at allocation time only; the engine may still lose a race for it.
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .map_err(|e| OrchestrateError::PortUnavailable {
            message: e.to_string(),
        })
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(0o700).create(path)
    }

    #[cfg(not(unix))]
    std::fs::create_dir(path)
}

fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    #[cfg(not(unix))]
    std::fs::write(path, bytes)
}
