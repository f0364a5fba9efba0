//! The self-daemonizing controller.
//!
//! A `Process` is run twice: once in the invoking "launcher" (no role marker in the
//! environment), which re-executes the same binary with the marker set and returns, and
//! once inside that detached child, which claims the pid file, starts the worker on its
//! own thread and then blocks dispatching signals until a handler exits the process.
//!
//! Restart hand-off is serialized on the pid lock: the old instance removes its pid
//! record before spawning the replacement, then waits for `Worker::restart()` and exits.
//! For a short while both processes are alive; only the new one owns the pid file.

use crate::dk::config::{validate_env_name, DaemonConfig, DEFAULT_ROLE_MARKER};
use crate::dk::error::DaemonError;
use crate::dk::event::{dk_event, dk_output};
use crate::dk::pid::PidRecord;
use crate::dk::platform::{SignalId, SignalListener};
use crate::dk::worker::Worker;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Handler = Arc<dyn Fn() + Send + Sync>;

enum Action {
    Stop,
    Restart,
    Custom(Handler),
}

/// Which side of the re-exec this invocation is on. Decided once, at `run()` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Launcher,
    Child,
}

impl Role {
    pub fn detect(role_marker: &str) -> Role {
        Role::from_value(std::env::var(role_marker).ok().as_deref())
    }

    pub fn from_value(value: Option<&str>) -> Role {
        match value {
            Some("true") => Role::Child,
            _ => Role::Launcher,
        }
    }
}

/// How to re-execute ourselves as the detached child.
struct Launcher {
    service: String,
    /// `None` means "argv[0] of this process" (falls back to `current_exe()`).
    program: Option<PathBuf>,
    args: Vec<OsString>,
    role_marker: String,
    pipeline: [Option<File>; 3],
}

impl Launcher {
    fn for_current_invocation(service: String) -> Launcher {
        Launcher {
            service,
            program: None,
            args: std::env::args_os().skip(1).collect(),
            role_marker: DEFAULT_ROLE_MARKER.to_string(),
            pipeline: [None, None, None],
        }
    }

    fn program(&self) -> Result<PathBuf, DaemonError> {
        if let Some(p) = &self.program {
            return Ok(p.clone());
        }
        match std::env::args_os().next() {
            Some(argv0) if !argv0.is_empty() => Ok(PathBuf::from(argv0)),
            _ => std::env::current_exe().map_err(|e| DaemonError::io("resolve current executable", e)),
        }
    }

    /// Start the child and let go of it without waiting. Returns the child's pid.
    fn spawn(&self) -> Result<u32, DaemonError> {
        let program = self.program()?;
        let mut cmd = Command::new(&program);
        cmd.args(&self.args);
        cmd.env(&self.role_marker, "true");
        cmd.stdin(stdio(&self.pipeline[0], "stdin")?);
        cmd.stdout(stdio(&self.pipeline[1], "stdout")?);
        cmd.stderr(stdio(&self.pipeline[2], "stderr")?);
        detach_session(&mut cmd);

        let child = cmd.spawn().map_err(|source| DaemonError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        // Dropping `Child` neither kills nor waits; the child is on its own now.
        drop(child);

        dk_event(
            "launcher",
            Some(&self.service),
            format!("spawned detached child pid={pid} program={}", program.display()),
        );
        Ok(pid)
    }
}

fn stdio(stream: &Option<File>, what: &str) -> Result<Stdio, DaemonError> {
    match stream {
        Some(f) => f
            .try_clone()
            .map(Stdio::from)
            .map_err(|e| DaemonError::io(format!("duplicate {what} for child"), e)),
        None => Ok(Stdio::inherit()),
    }
}

#[cfg(unix)]
fn detach_session(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and touches no state of the parent.
    unsafe {
        cmd.pre_exec(|| {
            let _ = nix::unistd::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach_session(_cmd: &mut Command) {}

/// A worker wired for detach, single-instance locking, and signal control.
pub struct Process {
    worker: Arc<dyn Worker>,
    pid: PidRecord,
    launcher: Launcher,
    stop_timeout: Option<Duration>,
    handlers: HashMap<SignalId, Action>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("service", &self.pid.service_name())
            .field("pid_file", &self.pid.save_filename())
            .field("role_marker", &self.launcher.role_marker)
            .field("stop_timeout", &self.stop_timeout)
            .field("signals", &self.handled_signals())
            .finish()
    }
}

impl Process {
    pub fn new(worker: Arc<dyn Worker>) -> Result<Process, DaemonError> {
        let name = worker.name();
        let pid = PidRecord::new(name.clone(), worker.pid_directory())?;
        let mut handlers = HashMap::new();
        handlers.insert(SignalId::STOP, Action::Stop);
        handlers.insert(SignalId::RESTART, Action::Restart);
        Ok(Process {
            worker,
            pid,
            launcher: Launcher::for_current_invocation(name),
            stop_timeout: None,
            handlers,
        })
    }

    /// Redirect the child's stdin/stdout/stderr. `None` inherits the launcher's stream.
    pub fn set_pipeline(mut self, stdin: Option<File>, stdout: Option<File>, stderr: Option<File>) -> Process {
        self.launcher.pipeline = [stdin, stdout, stderr];
        self
    }

    /// Rename the role-marker variable when the worker needs `DAEMON` for itself.
    pub fn set_role_marker(mut self, name: impl Into<String>) -> Process {
        self.launcher.role_marker = name.into();
        self
    }

    pub fn set_stop_timeout(mut self, timeout: Option<Duration>) -> Process {
        self.stop_timeout = timeout;
        self
    }

    pub fn set_pid_directory(mut self, dir: impl AsRef<Path>) -> Result<Process, DaemonError> {
        self.pid = PidRecord::new(self.pid.service_name().to_string(), dir)?;
        Ok(self)
    }

    /// Binary and arguments used to spawn the child (defaults: argv[0] and argv[1..]).
    pub fn set_relaunch_command<I, A>(mut self, program: impl Into<PathBuf>, args: I) -> Process
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.launcher.program = Some(program.into());
        self.launcher.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn apply_config(self, cfg: &DaemonConfig) -> anyhow::Result<Process> {
        validate_env_name(&cfg.role_marker)?;
        let [stdin, stdout, stderr] = cfg.pipeline.open()?;
        let mut p = self
            .set_role_marker(cfg.role_marker.clone())
            .set_stop_timeout(cfg.stop_timeout);
        if stdin.is_some() || stdout.is_some() || stderr.is_some() {
            p = p.set_pipeline(stdin, stdout, stderr);
        }
        if let Some(dir) = &cfg.pid_directory {
            p = p.set_pid_directory(dir)?;
        }
        Ok(p)
    }

    /// Register (or replace) the handler for `signal`. Must happen before `run()`.
    ///
    /// Replacing [`SignalId::STOP`] or [`SignalId::RESTART`] drops the default behavior.
    pub fn on<F>(&mut self, signal: SignalId, handler: F) -> &mut Process
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.insert(signal, Action::Custom(Arc::new(handler)));
        self
    }

    pub fn name(&self) -> &str {
        self.pid.service_name()
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid.save_filename()
    }

    pub fn role_marker(&self) -> &str {
        &self.launcher.role_marker
    }

    pub fn handled_signals(&self) -> Vec<SignalId> {
        let mut v: Vec<SignalId> = self.handlers.keys().copied().collect();
        v.sort();
        v
    }

    /// Launcher: spawn the detached child and return. Child: claim the pid file, start the
    /// worker and dispatch signals; only returns on error, handlers end the process.
    pub fn run(self) -> Result<(), DaemonError> {
        match Role::detect(&self.launcher.role_marker) {
            Role::Launcher => self.launcher.spawn().map(|_| ()),
            Role::Child => self.run_child(),
        }
    }

    fn run_child(self) -> Result<(), DaemonError> {
        let (handlers, ctx) = self.into_parts();

        // Listen before publishing the pid so a prompt STOP/RESTART is never lost.
        let mut listener = SignalListener::install(handlers.keys().copied())?;

        let pid = std::process::id() as i32;
        let pid_file = {
            let mut rec = ctx.pid.lock().unwrap_or_else(|p| p.into_inner());
            rec.save(pid)?;
            rec.save_filename()
        };
        dk_event(
            "daemon",
            Some(&ctx.service),
            format!("running pid={pid} pid_file={}", pid_file.display()),
        );

        let worker_ctx = Arc::clone(&ctx);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-worker", ctx.service))
            .spawn(move || {
                if let Some(code) = run_worker(&worker_ctx) {
                    std::process::exit(code);
                }
            });
        if let Err(e) = spawned {
            ctx.release_pid();
            return Err(DaemonError::io("spawn worker thread", e));
        }

        dispatch(&handlers, &ctx, listener.forever(), &|code| {
            std::process::exit(code);
        });
        Ok(())
    }

    fn into_parts(self) -> (HashMap<SignalId, Action>, Arc<Context>) {
        let ctx = Context {
            service: self.pid.service_name().to_string(),
            worker: self.worker,
            pid: Mutex::new(self.pid),
            launcher: self.launcher,
            stop_timeout: self.stop_timeout,
        };
        (self.handlers, Arc::new(ctx))
    }
}

/// State the default handlers need inside the running child.
struct Context {
    service: String,
    worker: Arc<dyn Worker>,
    pid: Mutex<PidRecord>,
    launcher: Launcher,
    stop_timeout: Option<Duration>,
}

impl Context {
    fn release_pid(&self) {
        let mut rec = self.pid.lock().unwrap_or_else(|p| p.into_inner());
        rec.remove();
    }

    /// Surface a hook outcome; never fails. `None` means the hook ran out of time.
    fn report(&self, hook: &str, outcome: Option<anyhow::Result<()>>) {
        match outcome {
            Some(Ok(())) => dk_event("worker", Some(&self.service), format!("{hook}() finished")),
            Some(Err(e)) => {
                let msg = format!("{hook}() failed: {e:#}");
                dk_output("worker", Some(&self.service), &msg);
                dk_event("worker", Some(&self.service), msg);
            }
            None => dk_event(
                "worker",
                Some(&self.service),
                format!(
                    "{hook}() did not finish within {:?}; continuing without it",
                    self.stop_timeout.unwrap_or_default()
                ),
            ),
        }
    }
}

/// Exit code used when `Worker::start()` panics.
const WORKER_PANIC_EXIT: i32 = 70;

/// Body of the worker thread. A panic in `start()` takes the whole instance down: the pid
/// record is released and the exit code to use is returned.
fn run_worker(ctx: &Arc<Context>) -> Option<i32> {
    let worker = Arc::clone(&ctx.worker);
    match panic::catch_unwind(AssertUnwindSafe(|| worker.start())) {
        Ok(()) => {
            dk_event("worker", Some(&ctx.service), "start() returned");
            None
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            dk_event("worker", Some(&ctx.service), format!("start() panicked: {reason}; exiting"));
            ctx.release_pid();
            Some(WORKER_PANIC_EXIT)
        }
    }
}

/// Run `f`, giving up after `timeout` (the hook thread is abandoned, not killed).
fn bounded<T, F>(timeout: Option<Duration>, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let Some(limit) = timeout else {
        return Some(f());
    };
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(limit).ok()
}

/// One handler call per received signal, serialized on the calling thread.
fn dispatch<I>(handlers: &HashMap<SignalId, Action>, ctx: &Arc<Context>, signals: I, exit: &dyn Fn(i32))
where
    I: IntoIterator<Item = SignalId>,
{
    for sig in signals {
        match handlers.get(&sig) {
            Some(Action::Stop) => exit(stop_sequence(ctx)),
            Some(Action::Restart) => exit(restart_sequence(ctx)),
            Some(Action::Custom(handler)) => {
                dk_event("signal", Some(&ctx.service), format!("{sig} -> custom handler"));
                handler();
            }
            None => dk_event("signal", Some(&ctx.service), format!("{sig} ignored (no handler)")),
        }
    }
}

/// Default STOP: worker `stop()`, drop the pid record, exit code.
fn stop_sequence(ctx: &Arc<Context>) -> i32 {
    dk_event("stop", Some(&ctx.service), "stop requested");
    let worker = Arc::clone(&ctx.worker);
    ctx.report("stop", bounded(ctx.stop_timeout, move || worker.stop()));
    ctx.release_pid();
    dk_event("stop", Some(&ctx.service), "pid file removed; exiting");
    0
}

/// Default RESTART: hand the service name to a fresh child, wind down, exit code.
fn restart_sequence(ctx: &Arc<Context>) -> i32 {
    dk_event("restart", Some(&ctx.service), "restart requested");
    ctx.release_pid();

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let hook_ctx = Arc::clone(ctx);
    std::thread::spawn(move || {
        let outcome = hook_ctx.worker.restart();
        hook_ctx.report("restart", Some(outcome));
        let _ = done_tx.send(());
    });

    match ctx.launcher.spawn() {
        Ok(pid) => dk_event("restart", Some(&ctx.service), format!("replacement started pid={pid}")),
        Err(e) => {
            let msg = format!("replacement spawn failed: {e}");
            dk_output("restart", Some(&ctx.service), &msg);
            dk_event("restart", Some(&ctx.service), msg);
        }
    }

    match ctx.stop_timeout {
        Some(limit) => {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(limit) {
                ctx.report("restart", None);
            }
        }
        None => {
            let _ = done_rx.recv();
        }
    }
    dk_event("restart", Some(&ctx.service), "old instance exiting");
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    // Never set in the test environment, so `run()` always takes the launcher branch.
    const UNSET_MARKER: &str = "DAEMONKIT_TEST_MARKER_NEVER_SET";

    struct MockWorker {
        dir: PathBuf,
        starts: AtomicUsize,
        stops: AtomicUsize,
        restarts: AtomicUsize,
        fail: bool,
        hang: Option<Duration>,
    }

    impl MockWorker {
        fn build(dir: &Path, fail: bool, hang: Option<Duration>) -> Arc<MockWorker> {
            Arc::new(MockWorker {
                dir: dir.to_path_buf(),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                restarts: AtomicUsize::new(0),
                fail,
                hang,
            })
        }

        fn new(dir: &Path) -> Arc<MockWorker> {
            MockWorker::build(dir, false, None)
        }

        fn failing(dir: &Path) -> Arc<MockWorker> {
            MockWorker::build(dir, true, None)
        }

        fn hanging(dir: &Path, hang: Duration) -> Arc<MockWorker> {
            MockWorker::build(dir, false, Some(hang))
        }
    }

    impl Worker for MockWorker {
        fn name(&self) -> String {
            "mock".to_string()
        }

        fn pid_directory(&self) -> PathBuf {
            self.dir.clone()
        }

        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self) -> anyhow::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if let Some(d) = self.hang {
                std::thread::sleep(d);
            }
            anyhow::ensure!(!self.fail, "mock stop failure");
            Ok(())
        }

        fn restart(&self) -> anyhow::Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(!self.fail, "mock restart failure");
            Ok(())
        }
    }

    fn process(worker: &Arc<MockWorker>) -> Process {
        let w: Arc<dyn Worker> = Arc::clone(worker) as Arc<dyn Worker>;
        Process::new(w).unwrap().set_role_marker(UNSET_MARKER)
    }

    /// Context whose pid record is already claimed, as inside a running child.
    fn claimed(p: Process) -> (HashMap<SignalId, Action>, Arc<Context>, PathBuf) {
        let (handlers, ctx) = p.into_parts();
        let path = {
            let mut rec = ctx.pid.lock().unwrap();
            rec.save(std::process::id() as i32).unwrap();
            rec.save_filename()
        };
        (handlers, ctx, path)
    }

    fn record_exits() -> (Arc<Mutex<Vec<i32>>>, impl Fn(i32)) {
        let exits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&exits);
        (exits, move |code| sink.lock().unwrap().push(code))
    }

    #[test]
    fn role_marker_value_must_be_true() {
        assert_eq!(Role::from_value(Some("true")), Role::Child);
        assert_eq!(Role::from_value(Some("1")), Role::Launcher);
        assert_eq!(Role::from_value(None), Role::Launcher);
        assert_eq!(Role::detect(UNSET_MARKER), Role::Launcher);
    }

    #[test]
    fn defaults_follow_worker() {
        let dir = tempfile::tempdir().unwrap();
        let w: Arc<dyn Worker> = MockWorker::new(dir.path());
        let p = Process::new(w).unwrap();
        assert_eq!(p.name(), "mock");
        assert_eq!(p.pid_file(), dir.path().join("mock.pid"));
        assert_eq!(p.role_marker(), "DAEMON");
        assert_eq!(p.handled_signals(), vec![SignalId::STOP, SignalId::RESTART]);
    }

    #[test]
    fn apply_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::new(dir.path());
        let cfg = DaemonConfig {
            role_marker: "MOCK_CHILD".to_string(),
            pid_directory: Some(dir.path().join("run")),
            stop_timeout: Some(Duration::from_secs(3)),
            ..DaemonConfig::default()
        };
        let p = process(&worker).apply_config(&cfg).unwrap();
        assert_eq!(p.role_marker(), "MOCK_CHILD");
        assert_eq!(p.pid_file(), dir.path().join("run").join("mock.pid"));
        assert_eq!(p.stop_timeout, Some(Duration::from_secs(3)));
    }

    #[cfg(unix)]
    #[test]
    fn launcher_spawns_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::new(dir.path());
        let p = process(&worker).set_relaunch_command("true", Vec::<OsString>::new());
        p.run().unwrap();
        assert!(!dir.path().join("mock.pid").exists());
        assert_eq!(worker.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn launcher_spawn_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::new(dir.path());
        let p = process(&worker).set_relaunch_command(dir.path().join("no-such-binary"), Vec::<OsString>::new());
        let err = p.run().unwrap_err();
        assert!(matches!(err, DaemonError::Spawn { .. }), "unexpected error: {err}");
    }

    #[cfg(unix)]
    #[test]
    fn child_refuses_to_start_when_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let mut owner = PidRecord::new("mock", dir.path()).unwrap();
        owner.save(1).unwrap();

        let worker = MockWorker::new(dir.path());
        let err = process(&worker).run_child().unwrap_err();
        assert!(err.is_lock_conflict(), "unexpected error: {err}");
        assert_eq!(worker.starts.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_to_string(owner.save_filename()).unwrap(), "1");
    }

    #[test]
    fn custom_handler_runs_once_per_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::new(dir.path());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let custom = SignalId::from_raw(1);

        let mut p = process(&worker);
        p.on(custom, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (handlers, ctx, path) = claimed(p);
        let (exits, exit) = record_exits();

        dispatch(&handlers, &ctx, vec![custom, SignalId::from_raw(77), custom], &exit);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(exits.lock().unwrap().is_empty());
        assert_eq!(worker.stops.load(Ordering::SeqCst), 0);
        assert_eq!(worker.restarts.load(Ordering::SeqCst), 0);
        assert!(path.exists());
    }

    #[test]
    fn custom_handler_can_replace_default_stop() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::new(dir.path());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        let mut p = process(&worker);
        p.on(SignalId::STOP, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (handlers, ctx, path) = claimed(p);
        let (exits, exit) = record_exits();

        dispatch(&handlers, &ctx, vec![SignalId::STOP], &exit);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stops.load(Ordering::SeqCst), 0);
        assert!(exits.lock().unwrap().is_empty());
        assert!(path.exists());
    }

    #[test]
    fn stop_removes_pid_and_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::new(dir.path());
        let (handlers, ctx, path) = claimed(process(&worker));
        let (exits, exit) = record_exits();

        dispatch(&handlers, &ctx, vec![SignalId::STOP], &exit);

        assert_eq!(*exits.lock().unwrap(), vec![0]);
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
        assert!(!path.exists());

        // The service name is free again.
        let mut next = PidRecord::new("mock", dir.path()).unwrap();
        next.save(2).unwrap();
    }

    #[test]
    fn failing_stop_still_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::failing(dir.path());
        let (_, ctx, path) = claimed(process(&worker));

        assert_eq!(stop_sequence(&ctx), 0);
        assert_eq!(worker.stops.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }

    #[test]
    fn hung_stop_is_abandoned_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::hanging(dir.path(), Duration::from_secs(5));
        let p = process(&worker).set_stop_timeout(Some(Duration::from_millis(50)));
        let (_, ctx, path) = claimed(p);

        let t0 = Instant::now();
        assert_eq!(stop_sequence(&ctx), 0);
        assert!(t0.elapsed() < Duration::from_secs(4));
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn restart_spawns_replacement_and_releases_pid() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::new(dir.path());
        let p = process(&worker).set_relaunch_command("true", Vec::<OsString>::new());
        let (handlers, ctx, path) = claimed(p);
        let (exits, exit) = record_exits();

        dispatch(&handlers, &ctx, vec![SignalId::RESTART], &exit);

        assert_eq!(*exits.lock().unwrap(), vec![0]);
        assert_eq!(worker.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(worker.stops.load(Ordering::SeqCst), 0);
        assert!(!path.exists());
    }

    #[test]
    fn restart_completes_even_if_spawn_and_hook_fail() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::failing(dir.path());
        let p = process(&worker).set_relaunch_command(dir.path().join("no-such-binary"), Vec::<OsString>::new());
        let (_, ctx, path) = claimed(p);

        assert_eq!(restart_sequence(&ctx), 0);
        assert_eq!(worker.restarts.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }

    struct Crashing {
        dir: PathBuf,
    }

    impl Worker for Crashing {
        fn name(&self) -> String {
            "crashing".to_string()
        }
        fn pid_directory(&self) -> PathBuf {
            self.dir.clone()
        }
        fn start(&self) {
            panic!("listener exploded");
        }
        fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn worker_panic_releases_pid_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let w: Arc<dyn Worker> = Arc::new(Crashing { dir: dir.path().to_path_buf() });
        let p = Process::new(w).unwrap().set_role_marker(UNSET_MARKER);
        let (_, ctx, path) = claimed(p);

        assert_eq!(run_worker(&ctx), Some(WORKER_PANIC_EXIT));
        assert!(!path.exists());

        let mut next = PidRecord::new("crashing", dir.path()).unwrap();
        next.save(2).unwrap();
    }

    #[test]
    fn worker_returning_normally_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MockWorker::new(dir.path());
        let (_, ctx, path) = claimed(process(&worker));

        assert_eq!(run_worker(&ctx), None);
        assert_eq!(worker.starts.load(Ordering::SeqCst), 1);
        assert!(path.exists());
    }

    #[test]
    fn bounded_without_timeout_runs_inline() {
        assert_eq!(bounded(None, || 7), Some(7));
        assert_eq!(bounded(Some(Duration::from_secs(5)), || 8), Some(8));
        assert_eq!(
            bounded(Some(Duration::from_millis(20)), || std::thread::sleep(Duration::from_secs(2))),
            None
        );
    }
}
