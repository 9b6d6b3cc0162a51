//! Prefixed line rendering for non-TUI output, plus per-process log files.
//!
//! This is the CI-facing consumer of the event stream: each complete output
//! line is printed with a colored `[name]` prefix (or a custom template),
//! status transitions become dim notices, and when `logDir` is set every
//! process also gets an ANSI-stripped log file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::{Duration, Instant};

use crate::color::{self, Rgb};
use crate::config::ResolvedConfig;
use crate::events::Event;
use crate::process::Status;

/// Formats a duration as seconds for user-facing notices: `0.2`, `1`, `30`.
pub fn format_seconds(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    if seconds.fract() == 0.0 {
        format!("{}", seconds as u64)
    } else {
        format!("{seconds:.1}")
    }
}

/// Renders manager events as prefixed lines on stdout.
pub struct LineRenderer {
    prefix_template: Option<String>,
    timestamps: bool,
    colors: HashMap<String, Rgb>,
    indices: HashMap<String, usize>,
    start: Instant,
    // Carry partial lines between output chunks, per process.
    partial: HashMap<String, String>,
    logs: HashMap<String, BufWriter<File>>,
}

impl LineRenderer {
    /// Assigns prefix colors (explicit `color` first, palette round-robin
    /// otherwise) and opens log files when `logDir` is set.
    pub fn new(config: &ResolvedConfig) -> Self {
        let mut names = config.names();
        if config.options.sort {
            names.sort();
        }

        let mut colors = HashMap::new();
        let mut indices = HashMap::new();
        for (index, name) in names.iter().enumerate() {
            let assigned = config.processes[name]
                .colors
                .first()
                .copied()
                .unwrap_or_else(|| color::palette_color(index));
            colors.insert(name.clone(), assigned);
            indices.insert(name.clone(), index);
        }

        let mut logs = HashMap::new();
        if let Some(dir) = &config.options.log_dir {
            if std::fs::create_dir_all(dir).is_ok() {
                for name in &names {
                    if let Ok(file) = File::create(dir.join(format!("{name}.log"))) {
                        logs.insert(name.clone(), BufWriter::new(file));
                    }
                }
            }
        }

        Self {
            prefix_template: config.options.prefix.clone(),
            timestamps: config.options.timestamps,
            colors,
            indices,
            start: Instant::now(),
            partial: HashMap::new(),
            logs,
        }
    }

    /// Renders one event.
    pub fn handle(&mut self, event: &Event) {
        match event {
            Event::Output { name, bytes } => self.handle_output(name, bytes),
            Event::Status { name, status } => self.handle_status(name, *status),
            Event::Error { name } => {
                let line = color::red("[numux] error output detected");
                self.print_line(name, &line);
            }
            // Exit codes surface through the status transition.
            Event::Exit { .. } => {}
        }
    }

    fn handle_output(&mut self, name: &str, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = Vec::new();
        {
            let buffer = self.partial.entry(name.to_string()).or_default();
            buffer.push_str(&text);
            while let Some(position) = buffer.find('\n') {
                let mut line: String = buffer.drain(..=position).collect();
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                lines.push(line);
            }
        }
        for line in lines {
            self.print_line(name, &line);
        }
    }

    fn handle_status(&mut self, name: &str, status: Status) {
        let notice = match status {
            Status::Pending | Status::Running => return,
            Status::Failed => color::red(&format!("[numux] {status}")),
            _ => color::dim(&format!("[numux] {status}")),
        };
        self.print_line(name, &notice);
    }

    fn print_line(&mut self, name: &str, line: &str) {
        println!("{}{line}", self.prefix(name));
        if let Some(log) = self.logs.get_mut(name) {
            let _ = writeln!(log, "{}", color::strip_ansi(line));
        }
    }

    fn prefix(&self, name: &str) -> String {
        let index = self.indices.get(name).copied().unwrap_or(0);
        let elapsed = self.elapsed();
        let mut rendered = match &self.prefix_template {
            Some(template) => render_template(template, name, index, &elapsed),
            None => format!("[{name}]"),
        };
        if self.timestamps && !self.prefix_template.as_deref().is_some_and(|t| t.contains("{time}"))
        {
            rendered = format!("{elapsed} {rendered}");
        }
        if let Some(assigned) = self.colors.get(name) {
            rendered = color::paint(&rendered, *assigned);
        }
        rendered.push(' ');
        rendered
    }

    fn elapsed(&self) -> String {
        let elapsed = self.start.elapsed().as_secs();
        format!("{:02}:{:02}", elapsed / 60, elapsed % 60)
    }
}

/// Token replacement for prefix templates.
fn render_template(template: &str, name: &str, index: usize, time: &str) -> String {
    template
        .replace("{name}", name)
        .replace("{index}", &index.to_string())
        .replace("{time}", time)
}
