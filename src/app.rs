//! Supervision of a single backend process
//!
//! An [`App`] owns one backend bound to one hostname. Starting it forks the
//! backend with its working directory set to the app directory, hands it the
//! write end of a readiness pipe, waits (bounded) for the readiness byte and
//! then probes the backend's socket until it accepts connections.

use crate::config::{AppConfig, AppDefaults, LauncherConfig, StopSignal};
use crate::error::RouterError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Byte a bootstrap writes to the readiness descriptor once its server is up
pub const READY_SENTINEL: u8 = b'!';

/// Environment variable carrying the TCP port a backend must bind
pub const PORT_ENV: &str = "PORT";
/// Environment variable carrying the unix socket path a backend must bind
pub const SOCKET_ENV: &str = "DEVGATE_SOCKET";
/// Environment variable carrying the readiness descriptor number
pub const READY_FD_ENV: &str = "DEVGATE_READY_FD";
/// Environment variable carrying the hostname the backend serves
pub const HOST_ENV: &str = "DEVGATE_HOST";

/// Longest unix socket path accepted; `sun_path` is 104 bytes on BSDs, 108 on Linux
pub const MAX_SOCKET_PATH_LEN: usize = 103;

/// How often a starting backend is checked for an early exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Lifecycle state of an app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// No process
    Stopped,
    /// Process forked, waiting for readiness
    Starting,
    /// Process ready to accept traffic
    Running,
    /// Stop signal sent, waiting for exit
    Stopping,
}

/// Where a backend listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Unix(PathBuf),
    Tcp(u16),
}

impl Target {
    /// Open and immediately close a connection to the target
    pub async fn probe(&self) -> io::Result<()> {
        match self {
            Target::Unix(path) => UnixStream::connect(path).await.map(drop),
            Target::Tcp(port) => TcpStream::connect(("127.0.0.1", *port)).await.map(drop),
        }
    }

    /// The value handed to a bootstrap script as its listen argument
    fn launch_arg(&self) -> String {
        match self {
            Target::Unix(path) => path.to_string_lossy().into_owned(),
            Target::Tcp(port) => port.to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Unix(path) => write!(f, "unix:{}", path.display()),
            Target::Tcp(port) => write!(f, "localhost:{}", port),
        }
    }
}

/// How the backend process is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// `<shell> -c <command>`; readiness is the connect probe alone
    ExplicitCommand(String),
    /// `<interpreter> <bootstrap> <target> <fd>`
    InterpreterPath(String),
    /// The default invocation run through `<shell> -l -c`
    ShellWrapped,
    /// `<default interpreter> <bootstrap> <target> <fd>`
    DefaultConvention,
}

impl LaunchMode {
    /// Pick the launch mode from per-app settings and marker files in `path`
    pub fn resolve(config: &AppConfig, path: &Path, launcher: &LauncherConfig) -> Self {
        if let Some(ref command) = config.command {
            return LaunchMode::ExplicitCommand(command.clone());
        }
        if let Some(ref interpreter) = config.interpreter {
            return LaunchMode::InterpreterPath(interpreter.clone());
        }
        let has_marker = launcher
            .marker_files
            .iter()
            .any(|marker| path.join(marker).exists());
        if config.full_shell || has_marker {
            LaunchMode::ShellWrapped
        } else {
            LaunchMode::DefaultConvention
        }
    }

    fn uses_readiness_pipe(&self) -> bool {
        !matches!(self, LaunchMode::ExplicitCommand(_))
    }
}

/// Settings shared by every app a router creates
#[derive(Debug, Clone)]
pub struct AppContext {
    /// Directory holding one sub-directory per app
    pub root: PathBuf,
    /// Scratch directory for unix sockets
    pub socket_dir: PathBuf,
    pub defaults: AppDefaults,
    pub launcher: LauncherConfig,
}

/// Resolved launch parameters for one app
#[derive(Debug, Clone)]
pub struct AppSpec {
    pub host: String,
    pub path: PathBuf,
    pub target: Target,
    pub idle_limit: Duration,
    pub launch_mode: LaunchMode,
    pub env: HashMap<String, String>,
}

impl AppSpec {
    /// Resolve the spec for `host`, served from the `app_name` directory under the root.
    ///
    /// Returns [`RouterError::UnconfiguredHost`] when the directory does not exist.
    pub fn resolve(host: &str, app_name: &str, ctx: &AppContext) -> Result<Self, RouterError> {
        let path = ctx.root.join(app_name);
        if !path.is_dir() {
            return Err(RouterError::UnconfiguredHost);
        }

        let config = AppConfig::load_for(&path)
            .map_err(|e| RouterError::start_failure(e.to_string()))?;

        let target = match config.port {
            Some(port) => Target::Tcp(port),
            None => {
                let socket = ctx.socket_dir.join(host);
                let len = socket.as_os_str().len();
                if len > MAX_SOCKET_PATH_LEN {
                    return Err(RouterError::start_failure(format!(
                        "Socket path {} is {} bytes, over the {}-byte limit for unix sockets",
                        socket.display(),
                        len,
                        MAX_SOCKET_PATH_LEN
                    )));
                }
                Target::Unix(socket)
            }
        };

        Ok(Self {
            host: host.to_string(),
            launch_mode: LaunchMode::resolve(&config, &path, &ctx.launcher),
            idle_limit: config.idle_timeout(&ctx.defaults),
            env: config.env,
            path,
            target,
        })
    }
}

/// A spawned backend. The process is the leader of its own process group so
/// stop signals also reach anything it forked.
struct Process {
    child: Child,
    pgid: u32,
}

/// A supervised backend bound to one hostname
pub struct App {
    spec: AppSpec,
    defaults: AppDefaults,
    launcher: LauncherConfig,
    state: Mutex<AppState>,
    last_hit: Mutex<Instant>,
    /// Set from spawn onwards, so a stop during startup reaches the process
    process: Mutex<Option<Process>>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("host", &self.spec.host)
            .field("target", &self.spec.target)
            .field("state", &self.state())
            .finish()
    }
}

impl App {
    pub fn new(spec: AppSpec, ctx: &AppContext) -> Self {
        Self {
            spec,
            defaults: ctx.defaults.clone(),
            launcher: ctx.launcher.clone(),
            state: Mutex::new(AppState::Stopped),
            last_hit: Mutex::new(Instant::now()),
            process: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn target(&self) -> &Target {
        &self.spec.target
    }

    pub fn launch_mode(&self) -> &LaunchMode {
        &self.spec.launch_mode
    }

    pub fn idle_limit(&self) -> Duration {
        self.spec.idle_limit
    }

    pub fn state(&self) -> AppState {
        *self.state.lock()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.lock().as_ref().and_then(|p| p.child.id())
    }

    /// Time since the last hit
    pub fn idle_for(&self) -> Duration {
        self.last_hit.lock().elapsed()
    }

    /// True once the app has been idle for longer than its idle limit
    pub fn expired(&self) -> bool {
        self.idle_for() > self.spec.idle_limit
    }

    /// Record traffic
    pub fn hit(&self) {
        let now = Instant::now();
        let mut last_hit = self.last_hit.lock();
        if now > *last_hit {
            *last_hit = now;
        }
    }

    /// True while the backend process exists and has not exited
    pub fn is_alive(&self) -> bool {
        self.exit_reason().is_none()
    }

    /// Why the backend is not running, or `None` while it is
    fn exit_reason(&self) -> Option<String> {
        match self.process.lock().as_mut() {
            None => Some("Backend was stopped".to_string()),
            Some(process) => match process.child.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(format!("Backend exited during startup ({})", status)),
                Err(e) => Some(format!("Failed to wait for backend: {}", e)),
            },
        }
    }

    /// Launch the backend and wait until it accepts connections.
    ///
    /// Fails with [`RouterError::UnconfiguredHost`] if the app directory is
    /// gone, and with [`RouterError::StartFailure`] if the app is not stopped,
    /// the process cannot be spawned, exits early, is stopped meanwhile, or is
    /// not reachable before the startup timeout.
    pub async fn start(&self) -> Result<(), RouterError> {
        {
            let mut state = self.state.lock();
            if *state != AppState::Stopped {
                return Err(RouterError::start_failure(format!(
                    "{} is already {:?}",
                    self.spec.host, *state
                )));
            }
            *state = AppState::Starting;
        }

        let failure = match self.launch().await {
            Ok(()) => {
                let mut state = self.state.lock();
                let pid = self.pid();
                // stop() takes the process handle; without it the start lost the race
                if *state == AppState::Starting && pid.is_some() {
                    info!(
                        hostname = %self.spec.host,
                        pid,
                        target = %self.spec.target,
                        "Backend is ready"
                    );
                    *self.last_hit.lock() = Instant::now();
                    *state = AppState::Running;
                    return Ok(());
                }
                RouterError::start_failure("Backend was stopped during startup")
            }
            Err(e) => e,
        };

        if failure != RouterError::UnconfiguredHost {
            error!(hostname = %self.spec.host, error = %failure, "Backend failed to start");
        }
        let process = self.process.lock().take();
        if let Some(mut process) = process {
            terminate(
                &self.spec.host,
                &mut process,
                self.defaults.stop_signal,
                self.defaults.shutdown_grace_period(),
            )
            .await;
        }
        self.remove_socket_file();
        let mut state = self.state.lock();
        if *state == AppState::Starting {
            *state = AppState::Stopped;
        }
        Err(failure)
    }

    async fn launch(&self) -> Result<(), RouterError> {
        if !self.spec.path.is_dir() {
            return Err(RouterError::UnconfiguredHost);
        }

        // A socket left behind by a previous run would make the bind fail
        self.remove_socket_file();

        let pipe = if self.spec.launch_mode.uses_readiness_pipe() {
            Some(readiness_pipe().map_err(|e| {
                RouterError::start_failure(format!("Failed to create readiness pipe: {}", e))
            })?)
        } else {
            None
        };

        let ready_fd = pipe.as_ref().map(|(_, write)| write.as_raw_fd());
        let mut cmd = self.command(ready_fd)?;

        info!(
            hostname = %self.spec.host,
            path = %self.spec.path.display(),
            mode = ?self.spec.launch_mode,
            target = %self.spec.target,
            "Starting backend"
        );

        let mut child = cmd.spawn().map_err(|e| {
            RouterError::start_failure(format!("Failed to spawn backend: {}", e))
        })?;
        let Some(pid) = child.id() else {
            return Err(RouterError::start_failure("Backend exited before it could be tracked"));
        };
        debug!(hostname = %self.spec.host, pid, "Backend process spawned");

        forward_output(&self.spec.host, &mut child);
        *self.process.lock() = Some(Process { child, pgid: pid });

        // Only the child may hold the write end from here on, so its exit closes the pipe
        let ready_rx = match pipe {
            Some((read, write)) => {
                drop(write);
                Some(pipe::Receiver::from_owned_fd(read).map_err(|e| {
                    RouterError::start_failure(format!("Failed to watch readiness pipe: {}", e))
                })?)
            }
            None => None,
        };

        let timeout = self.defaults.startup_timeout();
        tokio::time::timeout(timeout, async {
            if let Some(rx) = ready_rx {
                self.wait_for_readiness(rx).await?;
            }
            self.probe_until_ready().await
        })
        .await
        .unwrap_or_else(|_| {
            Err(RouterError::start_failure(format!(
                "Backend did not become ready within {} seconds",
                timeout.as_secs()
            )))
        })
    }
    /// Build the command for the configured launch mode
    fn command(&self, ready_fd: Option<RawFd>) -> Result<Command, RouterError> {
        let launcher = &self.launcher;
        let mut cmd = match self.spec.launch_mode {
            LaunchMode::ExplicitCommand(ref command) => {
                let mut cmd = Command::new(&launcher.shell);
                cmd.arg("-c").arg(command);
                cmd
            }
            LaunchMode::InterpreterPath(ref interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.args(self.bootstrap_args(ready_fd)?);
                cmd
            }
            LaunchMode::DefaultConvention => {
                let mut cmd = Command::new(&launcher.interpreter);
                cmd.args(self.bootstrap_args(ready_fd)?);
                cmd
            }
            LaunchMode::ShellWrapped => {
                let mut words = vec![launcher.interpreter.clone()];
                words.extend(self.bootstrap_args(ready_fd)?);
                let mut cmd = Command::new(&launcher.shell);
                cmd.arg("-l").arg("-c").arg(shell_words::join(&words));
                cmd
            }
        };

        cmd.current_dir(&self.spec.path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.process_group(0);

        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }
        cmd.env(HOST_ENV, &self.spec.host);
        match self.spec.target {
            Target::Tcp(port) => {
                cmd.env(PORT_ENV, port.to_string());
            }
            Target::Unix(ref path) => {
                cmd.env(SOCKET_ENV, path);
            }
        }

        if let Some(fd) = ready_fd {
            cmd.env(READY_FD_ENV, fd.to_string());
            // SAFETY: the closure only calls fcntl, which is async-signal-safe
            unsafe {
                cmd.pre_exec(move || clear_cloexec(fd));
            }
        }

        Ok(cmd)
    }

    fn bootstrap_args(&self, ready_fd: Option<RawFd>) -> Result<Vec<String>, RouterError> {
        let bootstrap = self.launcher.bootstrap.as_ref().ok_or_else(|| {
            RouterError::start_failure(
                "No bootstrap script configured (set launcher.bootstrap or a per-app command)",
            )
        })?;

        let mut args = vec![
            bootstrap.to_string_lossy().into_owned(),
            self.spec.target.launch_arg(),
        ];
        if let Some(fd) = ready_fd {
            args.push(fd.to_string());
        }
        Ok(args)
    }

    /// Connect-and-close the target with exponential backoff
    async fn probe_until_ready(&self) -> Result<(), RouterError> {
        let attempts = self.defaults.probe_attempts;
        let max_backoff = self.defaults.probe_max_backoff();
        let mut backoff = self.defaults.probe_initial_backoff();

        for attempt in 1..=attempts {
            if let Some(reason) = self.exit_reason() {
                return Err(RouterError::start_failure(reason));
            }

            match self.spec.target.probe().await {
                Ok(()) => {
                    debug!(hostname = %self.spec.host, attempt, "Backend accepted probe connection");
                    return Ok(());
                }
                Err(e) => {
                    debug!(hostname = %self.spec.host, attempt, error = %e, "Probe connection failed");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }

        Err(RouterError::start_failure(format!(
            "{} not accepting connections after {} attempts",
            self.spec.target, attempts
        )))
    }

    /// Wait for the readiness byte, pipe closure or process exit
    async fn wait_for_readiness(&self, mut rx: pipe::Receiver) -> Result<(), RouterError> {
        let mut buf = [0u8; 1];
        tokio::select! {
            read = rx.read(&mut buf) => match read {
                Ok(1) if buf[0] == READY_SENTINEL => Ok(()),
                Ok(1) => Err(RouterError::start_failure(format!(
                    "Backend reported startup failure (status byte {:#04x})",
                    buf[0]
                ))),
                // Closing the descriptor also counts as a readiness signal; the
                // probe that follows catches a process that closed it by exiting
                Ok(_) => Ok(()),
                Err(e) => Err(RouterError::start_failure(format!(
                    "Failed to read readiness pipe: {}",
                    e
                ))),
            },
            reason = self.wait_for_exit() => Err(RouterError::start_failure(reason)),
        }
    }

    async fn wait_for_exit(&self) -> String {
        loop {
            if let Some(reason) = self.exit_reason() {
                return reason;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Stop the backend: stop signal, bounded wait, then SIGKILL.
    ///
    /// Calling this on an app without a process is a no-op; the handle is taken
    /// exactly once so the process is never signalled twice. A start still in
    /// progress fails once its process is gone.
    pub async fn stop(&self) {
        let process = self.process.lock().take();
        let Some(mut process) = process else {
            return;
        };

        *self.state.lock() = AppState::Stopping;
        terminate(
            &self.spec.host,
            &mut process,
            self.defaults.stop_signal,
            self.defaults.shutdown_grace_period(),
        )
        .await;
        self.remove_socket_file();
        *self.state.lock() = AppState::Stopped;
    }

    fn remove_socket_file(&self) {
        if let Target::Unix(ref path) = self.spec.target {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(hostname = %self.spec.host, socket = %path.display(), "Removed socket file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(hostname = %self.spec.host, socket = %path.display(), error = %e, "Failed to remove socket file"),
            }
        }
    }
}

/// Signal every process in the backend's group
fn signal_group(pgid: u32, signal: libc::c_int) {
    // Never 0 or 1: kill(0) and kill(-1) reach far more than the backend
    if pgid <= 1 {
        return;
    }
    // SAFETY: plain syscall; the group was created for this backend at spawn
    unsafe {
        libc::kill(-(pgid as libc::pid_t), signal);
    }
}

/// Send the stop signal to the process group, wait up to `grace_period` for
/// the leader, then SIGKILL whatever is left of the group
async fn terminate(hostname: &str, process: &mut Process, signal: StopSignal, grace_period: Duration) {
    let pgid = process.pgid;
    info!(hostname, pgid, ?signal, "Sending stop signal to backend");
    signal_group(pgid, signal.as_raw());

    match tokio::time::timeout(grace_period, process.child.wait()).await {
        Ok(Ok(status)) => {
            info!(hostname, ?status, "Backend process exited");
        }
        Ok(Err(e)) => {
            warn!(hostname, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                hostname,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            signal_group(pgid, libc::SIGKILL);
            let _ = process.child.kill().await;
        }
    }

    // Group members that outlive the leader are not waited for
    signal_group(pgid, libc::SIGKILL);
}

/// Re-emit the backend's stdout and stderr through tracing
fn forward_output(hostname: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(log_lines(hostname.to_string(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_lines(hostname.to_string(), "stderr", stderr));
    }
}

async fn log_lines<R>(hostname: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if !line.is_empty() {
            info!(target: "backend", hostname = %hostname, stream, "{}", line);
        }
    }
}

/// Create a pipe whose ends are both close-on-exec in this process
fn readiness_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [0; 2];

    #[cfg(target_os = "linux")]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(target_os = "linux"))]
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };

    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: pipe() just returned these descriptors and nothing else owns them
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(target_os = "linux"))]
    for fd in [&read, &write] {
        set_cloexec(fd.as_raw_fd())?;
    }

    Ok((read, write))
}

#[cfg(not(target_os = "linux"))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Runs in the forked child so the readiness descriptor survives exec
fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn test_context(root: &Path) -> AppContext {
        AppContext {
            root: root.to_path_buf(),
            socket_dir: root.join("sockets"),
            defaults: AppDefaults {
                startup_timeout_secs: 5,
                shutdown_grace_period_secs: 1,
                probe_attempts: 5,
                probe_initial_backoff_ms: 10,
                probe_max_backoff_ms: 50,
                ..AppDefaults::default()
            },
            launcher: LauncherConfig {
                shell: "sh".to_string(),
                ..LauncherConfig::default()
            },
        }
    }

    fn command_spec(root: &Path, command: &str, port: u16) -> AppSpec {
        let path = root.join("app");
        std::fs::create_dir_all(&path).unwrap();
        AppSpec {
            host: "app.dev".to_string(),
            path,
            target: Target::Tcp(port),
            idle_limit: Duration::from_secs(60),
            launch_mode: LaunchMode::ExplicitCommand(command.to_string()),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_launch_mode_explicit_command_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".rvmrc"), "").unwrap();
        let config = AppConfig {
            command: Some("bin/rails s".to_string()),
            interpreter: Some("/usr/bin/ruby".to_string()),
            full_shell: true,
            ..AppConfig::default()
        };

        assert_eq!(
            LaunchMode::resolve(&config, dir.path(), &LauncherConfig::default()),
            LaunchMode::ExplicitCommand("bin/rails s".to_string())
        );
    }

    #[test]
    fn test_launch_mode_interpreter_before_shell() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            interpreter: Some("/opt/ruby/bin/ruby".to_string()),
            full_shell: true,
            ..AppConfig::default()
        };

        assert_eq!(
            LaunchMode::resolve(&config, dir.path(), &LauncherConfig::default()),
            LaunchMode::InterpreterPath("/opt/ruby/bin/ruby".to_string())
        );
    }

    #[test]
    fn test_launch_mode_marker_file_forces_shell() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = LauncherConfig::default();

        assert_eq!(
            LaunchMode::resolve(&AppConfig::default(), dir.path(), &launcher),
            LaunchMode::DefaultConvention
        );

        std::fs::write(dir.path().join(".rbenv-version"), "3.3.0").unwrap();
        assert_eq!(
            LaunchMode::resolve(&AppConfig::default(), dir.path(), &launcher),
            LaunchMode::ShellWrapped
        );
    }

    #[test]
    fn test_launch_mode_full_shell() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            full_shell: true,
            ..AppConfig::default()
        };
        assert_eq!(
            LaunchMode::resolve(&config, dir.path(), &LauncherConfig::default()),
            LaunchMode::ShellWrapped
        );
    }

    #[test]
    fn test_resolve_missing_directory_is_unconfigured() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());

        let err = AppSpec::resolve("ghost.dev", "ghost", &ctx).unwrap_err();
        assert_eq!(err, RouterError::UnconfiguredHost);
    }

    #[test]
    fn test_resolve_targets() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        std::fs::create_dir(root.path().join("blog")).unwrap();
        std::fs::create_dir(root.path().join("api")).unwrap();
        std::fs::write(root.path().join("api.toml"), "port = 4100\nidle_timeout_secs = 7\n").unwrap();

        let blog = AppSpec::resolve("blog.dev", "blog", &ctx).unwrap();
        assert_eq!(blog.target, Target::Unix(ctx.socket_dir.join("blog.dev")));
        assert_eq!(blog.idle_limit, Duration::from_secs(300));
        assert_eq!(blog.launch_mode, LaunchMode::DefaultConvention);

        let api = AppSpec::resolve("api.dev", "api", &ctx).unwrap();
        assert_eq!(api.target, Target::Tcp(4100));
        assert_eq!(api.idle_limit, Duration::from_secs(7));
    }

    #[test]
    fn test_resolve_invalid_app_config_is_start_failure() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        std::fs::create_dir(root.path().join("bad")).unwrap();
        std::fs::write(root.path().join("bad.toml"), "full_shell = \"yes please\"").unwrap();

        let err = AppSpec::resolve("bad.dev", "bad", &ctx).unwrap_err();
        assert!(matches!(err, RouterError::StartFailure(_)), "got {:?}", err);
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::Tcp(3000).to_string(), "localhost:3000");
        assert_eq!(
            Target::Unix(PathBuf::from("/tmp/s/blog.dev")).to_string(),
            "unix:/tmp/s/blog.dev"
        );
    }

    #[test]
    fn test_expired_and_hit() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let mut spec = command_spec(root.path(), "true", 1);
        spec.idle_limit = Duration::from_millis(30);
        let app = App::new(spec, &ctx);

        assert!(!app.expired());
        std::thread::sleep(Duration::from_millis(60));
        assert!(app.expired());

        app.hit();
        assert!(!app.expired());
        assert!(app.idle_for() < Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_stop_without_process_is_noop() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let app = App::new(command_spec(root.path(), "true", 1), &ctx);

        app.stop().await;
        app.stop().await;
        assert_eq!(app.state(), AppState::Stopped);
        assert!(!app.is_alive());
    }

    #[tokio::test]
    async fn test_start_missing_directory_is_unconfigured() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let mut spec = command_spec(root.path(), "true", 1);
        spec.path = root.path().join("removed");
        let app = App::new(spec, &ctx);

        assert_eq!(app.start().await, Err(RouterError::UnconfiguredHost));
        assert_eq!(app.state(), AppState::Stopped);
    }

    #[tokio::test]
    async fn test_start_fails_when_process_exits() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let app = App::new(command_spec(root.path(), "exit 3", port), &ctx);

        let err = app.start().await.unwrap_err();
        assert!(matches!(err, RouterError::StartFailure(_)), "got {:?}", err);
        assert_eq!(app.state(), AppState::Stopped);
        assert!(app.pid().is_none());
    }

    #[tokio::test]
    async fn test_start_fails_when_nothing_listens() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let app = App::new(command_spec(root.path(), "exec sleep 30", port), &ctx);

        let err = app.start().await.unwrap_err();
        match err {
            RouterError::StartFailure(message) => {
                assert!(message.contains("not accepting connections"), "{}", message)
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(app.state(), AppState::Stopped);
    }

    #[tokio::test]
    async fn test_bootstrap_required_for_default_convention() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let mut spec = command_spec(root.path(), "unused", 1);
        spec.launch_mode = LaunchMode::DefaultConvention;
        let app = App::new(spec, &ctx);

        let err = app.start().await.unwrap_err();
        match err {
            RouterError::StartFailure(message) => assert!(message.contains("bootstrap")),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(app.state(), AppState::Stopped);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());

        // The test owns the listener, so the probe succeeds as soon as the process runs
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let app = App::new(command_spec(root.path(), "exec sleep 30", port), &ctx);
        app.start().await.unwrap();

        assert_eq!(app.state(), AppState::Running);
        assert!(app.pid().is_some());
        assert!(app.is_alive());

        // A second start is rejected while running
        assert!(matches!(app.start().await, Err(RouterError::StartFailure(_))));
        assert_eq!(app.state(), AppState::Running);

        app.stop().await;
        assert_eq!(app.state(), AppState::Stopped);
        assert!(app.pid().is_none());
        assert!(!app.is_alive());

        // Idempotent
        app.stop().await;
        assert_eq!(app.state(), AppState::Stopped);
    }

    #[tokio::test]
    async fn test_is_alive_detects_exit() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let app = App::new(command_spec(root.path(), "sleep 0.3", port), &ctx);
        app.start().await.unwrap();
        assert!(app.is_alive());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!app.is_alive());

        app.stop().await;
        assert_eq!(app.state(), AppState::Stopped);
    }

    #[test]
    fn test_resolve_rejects_overlong_socket_path() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        std::fs::create_dir(root.path().join("app")).unwrap();
        let host = format!("{}.dev", "a".repeat(MAX_SOCKET_PATH_LEN));

        match AppSpec::resolve(&host, "app", &ctx).unwrap_err() {
            RouterError::StartFailure(message) => assert!(message.contains("limit"), "{}", message),
            other => panic!("unexpected error {:?}", other),
        }
    }

    /// Running and not a zombie
    #[cfg(target_os = "linux")]
    fn process_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map_or(false, |state| state != 'Z'),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn wait_for_exit_of(pid: u32) -> bool {
        for _ in 0..40 {
            if !process_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Read a pid the backend wrote to `file`, waiting for it to appear
    #[cfg(target_os = "linux")]
    async fn read_pid_file(file: &Path) -> u32 {
        for _ in 0..40 {
            if let Ok(text) = std::fs::read_to_string(file) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no pid written to {}", file.display());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_start_times_out_without_readiness_byte() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = test_context(root.path());
        ctx.defaults.startup_timeout_secs = 1;
        ctx.launcher.interpreter = "sh".to_string();
        ctx.launcher.bootstrap = Some(PathBuf::from("boot.sh"));

        // The bootstrap stays alive holding the descriptor but never writes to it
        let path = root.path().join("slow");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("boot.sh"), "sleep 30 &\necho $! > sleeper.pid\nwait\n").unwrap();

        let spec = AppSpec {
            host: "slow.dev".to_string(),
            path: path.clone(),
            target: Target::Tcp(1),
            idle_limit: Duration::from_secs(60),
            launch_mode: LaunchMode::DefaultConvention,
            env: HashMap::new(),
        };
        let app = App::new(spec, &ctx);

        let started = Instant::now();
        match app.start().await.unwrap_err() {
            RouterError::StartFailure(message) => {
                assert!(message.contains("did not become ready within 1 seconds"), "{}", message)
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(4), "took {:?}", started.elapsed());
        assert_eq!(app.state(), AppState::Stopped);
        assert!(app.pid().is_none());

        // The bootstrap's own child goes down with it
        let sleeper = read_pid_file(&path.join("sleeper.pid")).await;
        assert!(wait_for_exit_of(sleeper).await, "process {} survived a failed start", sleeper);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_kills_backend_ignoring_stop_signal() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let app = App::new(command_spec(root.path(), "trap '' TERM; exec sleep 30", port), &ctx);
        app.start().await.unwrap();
        let pid = app.pid().unwrap();

        // Wait for the exec so the trap is in place
        for _ in 0..40 {
            let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).unwrap_or_default();
            if comm.trim() == "sleep" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let stopping = Instant::now();
        app.stop().await;
        let elapsed = stopping.elapsed();

        // One grace period (1s in the test context), then SIGKILL
        assert!(elapsed >= Duration::from_millis(900), "stopped after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "stopped after {:?}", elapsed);
        assert_eq!(app.state(), AppState::Stopped);
        assert!(!process_running(pid));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_reaches_forked_children() {
        let root = tempfile::tempdir().unwrap();
        let ctx = test_context(root.path());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let app = App::new(
            command_spec(root.path(), "sleep 30 & echo $! > server.pid; wait", port),
            &ctx,
        );
        app.start().await.unwrap();
        let server = read_pid_file(&root.path().join("app").join("server.pid")).await;
        assert!(process_running(server));

        app.stop().await;

        assert_eq!(app.state(), AppState::Stopped);
        assert!(wait_for_exit_of(server).await, "forked process {} survived stop", server);
    }

    #[tokio::test]
    async fn test_stop_during_startup_fails_the_start() {
        let root = tempfile::tempdir().unwrap();
        let mut ctx = test_context(root.path());
        ctx.defaults.probe_attempts = 500;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let app = Arc::new(App::new(command_spec(root.path(), "exec sleep 30", port), &ctx));
        let starting = tokio::spawn({
            let app = Arc::clone(&app);
            async move { app.start().await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(app.state(), AppState::Starting);
        assert!(app.pid().is_some());

        app.stop().await;
        let outcome = tokio::time::timeout(Duration::from_secs(2), starting)
            .await
            .expect("start did not notice the stop")
            .unwrap();

        assert!(matches!(outcome, Err(RouterError::StartFailure(_))), "got {:?}", outcome);
        assert_eq!(app.state(), AppState::Stopped);
        assert!(app.pid().is_none());
    }
}
