use std::path::PathBuf;

/// A long-running task that can be embedded in a self-daemonizing [`Process`].
///
/// `start()` runs on its own thread inside the daemon and may block for the life of the
/// service. `stop()` and `restart()` are called from the signal dispatch thread and must
/// make `start()` wind down; their errors are reported but never abort cleanup.
///
/// [`Process`]: crate::dk::process::Process
pub trait Worker: Send + Sync + 'static {
    /// Stable service identifier; also the pid file base name.
    fn name(&self) -> String;

    /// Directory the pid file is written to.
    fn pid_directory(&self) -> PathBuf;

    fn start(&self);

    fn stop(&self) -> anyhow::Result<()>;

    /// Shutdown hook for the in-place restart path.
    fn restart(&self) -> anyhow::Result<()> {
        self.stop()
    }
}
