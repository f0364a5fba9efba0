//! Command wiring for embedding applications.
//!
//! Services live in an explicit [`Registry`] that the application builds and hands to
//! [`dispatch`]; there is no process-global list of workers. `start` runs the service's
//! [`Process`]; `stop`, `restart` and `signal` locate the running instance through its
//! pid file and deliver a signal to it.

use crate::dk::error::DaemonError;
use crate::dk::pid::{self, Instance};
use crate::dk::platform::{self, SignalId};
use crate::dk::process::Process;
use anyhow::Context as _;
use clap::{Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start the service in the background
    Start,
    /// Stop the running instance (graceful, via SIGUSR1)
    Stop,
    /// Restart the running instance in place (via SIGUSR2); the service decides how to wind down
    Restart,
    /// Show whether the service is running
    Status {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Deliver a signal to the running instance, e.g. HUP or SIGUSR1
    Signal { signal: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Default)]
pub struct Registry {
    processes: BTreeMap<String, Process>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each service name may be registered once; two `Process`es for one name would fight
    /// over the same pid file.
    pub fn register(&mut self, process: Process) -> Result<&mut Registry, DaemonError> {
        let name = process.name().to_string();
        if self.processes.contains_key(&name) {
            return Err(DaemonError::DuplicateService(name));
        }
        self.processes.insert(name, process);
        Ok(self)
    }

    pub fn names(&self) -> Vec<&str> {
        self.processes.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Process> {
        self.processes.get(name)
    }

    pub fn take(&mut self, name: &str) -> Option<Process> {
        self.processes.remove(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub service: String,
    pub pid_file: PathBuf,
    /// running / stopped / stale
    pub state: &'static str,
    pub pid: Option<i32>,
}

impl StatusReport {
    fn new(service: &str, pid_file: &Path, instance: Instance) -> Self {
        let (state, pid) = match instance {
            Instance::Absent => ("stopped", None),
            Instance::Running { pid } => ("running", Some(pid)),
            Instance::Stale { pid } => ("stale", Some(pid)),
        };
        Self {
            service: service.to_string(),
            pid_file: pid_file.to_path_buf(),
            state,
            pid,
        }
    }

    pub fn render_text(&self) -> String {
        match (self.state, self.pid) {
            ("running", Some(pid)) => format!("{} is running (pid {})", self.service, pid),
            ("stale", Some(pid)) => format!(
                "{} is not running (stale pid file {} names pid {})",
                self.service,
                self.pid_file.display(),
                pid
            ),
            _ => format!("{} is not running", self.service),
        }
    }
}

pub fn status(service: &str, pid_file: &Path) -> anyhow::Result<StatusReport> {
    let instance = pid::probe(pid_file).with_context(|| format!("probe {service}"))?;
    Ok(StatusReport::new(service, pid_file, instance))
}

pub fn dispatch(registry: &mut Registry, service: &str, cmd: Cmd) -> anyhow::Result<()> {
    let pid_file = match registry.get(service) {
        Some(p) => p.pid_file(),
        None => {
            let known = registry.names().join(", ");
            anyhow::bail!("unknown service {service:?} (registered: {known})");
        }
    };

    match cmd {
        Cmd::Start => {
            let Some(process) = registry.take(service) else {
                anyhow::bail!("unknown service {service:?}");
            };
            process.run().with_context(|| format!("start {service}"))?;
            Ok(())
        }
        Cmd::Stop => deliver(service, &pid_file, SignalId::STOP),
        Cmd::Restart => deliver(service, &pid_file, SignalId::RESTART),
        Cmd::Signal { signal } => deliver(service, &pid_file, platform::parse_signal(&signal)?),
        Cmd::Status { format } => {
            let report = status(service, &pid_file)?;
            match format {
                OutputFormat::Text => println!("{}", report.render_text()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            Ok(())
        }
    }
}

/// Signal the instance that owns `pid_file`. A stale file is never trusted: its pid may
/// have been reused by an unrelated process.
pub fn deliver(service: &str, pid_file: &Path, signal: SignalId) -> anyhow::Result<()> {
    let pid = match pid::probe(pid_file)? {
        Instance::Running { pid } => pid,
        Instance::Absent => anyhow::bail!("{service} is not running (no pid file at {})", pid_file.display()),
        Instance::Stale { pid } => anyhow::bail!(
            "{service} is not running (stale pid file {} names pid {pid}); remove it and retry",
            pid_file.display()
        ),
    };
    platform::send_signal(pid, signal).with_context(|| format!("signal {service}"))?;
    println!("sent {signal} to {service} (pid {pid})");
    Ok(())
}
