use chrono::Local;
use std::io::Write;

pub(crate) fn event_line(component: &str, service: Option<&str>, msg: &str) -> String {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    match service {
        Some(s) => format!("{ts} [{component}] service={s} {msg}"),
        None => format!("{ts} [{component}] {msg}"),
    }
}

/// Lifecycle log line on stderr (the child's error stream after detaching).
pub fn dk_event(component: &str, service: Option<&str>, msg: impl AsRef<str>) {
    eprintln!("{}", event_line(component, service, msg.as_ref()));
}

/// Same line on stdout; worker hook failures go here so they land in the output stream.
pub(crate) fn dk_output(component: &str, service: Option<&str>, msg: impl AsRef<str>) {
    let line = event_line(component, service, msg.as_ref());
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_carries_component_and_service() {
        let line = event_line("stop", Some("http"), "pid file removed");
        assert!(line.ends_with(" [stop] service=http pid file removed"), "{line}");

        let line = event_line("launcher", None, "spawned");
        assert!(line.ends_with(" [launcher] spawned"), "{line}");
    }
}
