/// Serial monitor: the fire-and-forget display channel.
///
/// Components report through a cloned `Monitor`; a single printer task owns the
/// terminal. Sending never blocks and never fails the caller; if the printer
/// is gone the line is dropped.
use chrono::{DateTime, Local};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorLine {
    pub at: DateTime<Local>,
    pub text: String,
    /// Status lines describe the tool itself; data lines echo device output.
    pub is_status: bool,
}

#[derive(Debug, Clone)]
pub struct Monitor {
    tx: mpsc::UnboundedSender<MonitorLine>,
}

impl Monitor {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MonitorLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn status(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("{text}");
        self.push(text, true);
    }

    pub fn data(&self, text: impl Into<String>) {
        self.push(text.into(), false);
    }

    fn push(&self, text: String, is_status: bool) {
        let _ = self.tx.send(MonitorLine {
            at: Local::now(),
            text,
            is_status,
        });
    }
}

/// Format a line the way the printer shows it.
pub fn render(line: &MonitorLine) -> String {
    let stamp = line.at.format("%H:%M:%S");
    if line.is_status {
        format!("[{stamp}] * {}", line.text)
    } else {
        format!("[{stamp}] {}", line.text.trim_end())
    }
}

/// Print monitor lines to stdout until every `Monitor` is dropped.
///
/// With `show_data == false` only status lines are printed.
pub fn spawn_printer(
    mut rx: mpsc::UnboundedReceiver<MonitorLine>,
    show_data: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if line.is_status || show_data {
                println!("{}", render(&line));
            }
        }
    })
}

#[cfg(test)]
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorLine>) -> Vec<MonitorLine> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_data_lines_tagged() {
        let (monitor, mut rx) = Monitor::channel();
        monitor.status("Connection established");
        monitor.data("42.5\r\n");

        let lines = drain(&mut rx);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].is_status);
        assert_eq!(lines[0].text, "Connection established");
        assert!(!lines[1].is_status);
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (monitor, rx) = Monitor::channel();
        drop(rx);
        monitor.status("nobody listening");
    }

    #[test]
    fn test_render_marks_status_and_trims_data() {
        let (monitor, mut rx) = Monitor::channel();
        monitor.status("Device connected");
        monitor.data("7\r\n");
        let lines = drain(&mut rx);

        let status = render(&lines[0]);
        assert!(status.starts_with('['));
        assert!(status.ends_with("* Device connected"));
        assert!(render(&lines[1]).ends_with("] 7"));
    }
}
