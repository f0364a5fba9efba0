pub mod dk;

pub use dk::error::DaemonError;
pub use dk::pid::{Instance, PidRecord};
pub use dk::platform::{SignalId, parse_signal, send_signal, try_exclusive_lock};
pub use dk::process::{Process, Role};
pub use dk::worker::Worker;
