use anyhow::Context as _;
use axum::{routing::get, Router};
use clap::Parser;
use daemonkit::dk::cli::{self, Cmd, Registry};
use daemonkit::dk::config::{self, DaemonConfig};
use daemonkit::dk::event::dk_event;
use daemonkit::{Process, Worker};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);
const BIND_ATTEMPTS: u32 = 50;

#[derive(Debug, Parser)]
#[command(name = "httpd", version, about = "hello-world HTTP service that runs itself in the background")]
struct Args {
    /// Path to daemon config YAML
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Service name (also the pid file name)
    #[arg(short = 's', long = "service", default_value = "http")]
    service: String,

    /// Directory for the pid file (overridden by pid_directory in the config)
    #[arg(long = "pid-dir", default_value = "./")]
    pid_dir: PathBuf,

    #[arg(short = 'p', long = "port", default_value_t = 9047)]
    port: u16,

    #[command(subcommand)]
    cmd: Cmd,
}

struct HttpServer {
    name: String,
    pid_dir: PathBuf,
    port: u16,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    finished: Mutex<Option<mpsc::Receiver<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl HttpServer {
    fn new(name: &str, pid_dir: PathBuf, port: u16) -> Self {
        Self {
            name: name.to_string(),
            pid_dir,
            port,
            shutdown: Mutex::new(None),
            finished: Mutex::new(None),
        }
    }
}

impl Worker for HttpServer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn pid_directory(&self) -> PathBuf {
        self.pid_dir.clone()
    }

    fn start(&self) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = mpsc::channel();
        *lock(&self.shutdown) = Some(shutdown_tx);
        *lock(&self.finished) = Some(done_rx);

        let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                dk_event("http", Some(&self.name), format!("build tokio runtime failed: {e}"));
                return;
            }
        };
        if let Err(e) = rt.block_on(serve(self.port, shutdown_rx)) {
            dk_event("http", Some(&self.name), format!("server error: {e:#}"));
        }
        let _ = done_tx.send(());
    }

    fn stop(&self) -> anyhow::Result<()> {
        println!("closing server");
        // Not started yet: nothing to shut down.
        let Some(tx) = lock(&self.shutdown).take() else {
            return Ok(());
        };
        let _ = tx.send(());
        if let Some(done) = lock(&self.finished).take() {
            done.recv_timeout(SHUTDOWN_WAIT)
                .map_err(|_| anyhow::anyhow!("server still running after {SHUTDOWN_WAIT:?}"))?;
        }
        println!("server closed");
        Ok(())
    }

    fn restart(&self) -> anyhow::Result<()> {
        println!("server restarting");
        self.stop()
    }
}

async fn serve(port: u16, shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
    let listener = bind_with_retry(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let app = Router::new().route("/", get(|| async { "hello world" }));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
        })
        .await
        .context("serve")?;
    Ok(())
}

/// During an in-place restart the old instance may still hold the port for a moment.
async fn bind_with_retry(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let mut attempt = 0;
    loop {
        match TcpListener::bind(addr).await {
            Ok(l) => return Ok(l),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e).with_context(|| format!("bind {addr}")),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => config::load_config(path)?,
        None => DaemonConfig::default(),
    };

    let worker = Arc::new(HttpServer::new(&args.service, args.pid_dir.clone(), args.port));
    let mut process = Process::new(worker)?.apply_config(&cfg)?;

    #[cfg(unix)]
    {
        let service = args.service.clone();
        process.on(daemonkit::parse_signal("HUP")?, move || {
            dk_event("http", Some(&service), "SIGHUP received; nothing to reload");
        });
    }

    let mut registry = Registry::new();
    registry.register(process)?;
    cli::dispatch(&mut registry, &args.service, args.cmd)
}
