//! Console output.

use std::io::Write;

use crossterm::style::Stylize;
use kiln_core::{Local, Reporter};
use kiln_schema::ComponentLock;

/// Prints fetch progress to stderr, one line per event.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    /// Create a reporter.
    pub fn new() -> Self {
        Self
    }
}

fn line(text: &str) {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{text}");
}

impl Reporter for ConsoleReporter {
    fn section(&self, title: &str) {
        line(&format!("\n{}", title.bold()));
    }

    fn downloading(&self, lock: &ComponentLock) {
        line(&format!(
            "  {} {} {} {}",
            "fetching".cyan(),
            lock.name,
            lock.version.as_str().dark_grey(),
            format!("({})", lock.remote_source).dark_grey()
        ));
    }

    fn done(&self, local: &Local) {
        line(&format!(
            "  {} {} {}",
            "done".green(),
            local.lock.name,
            local.lock.version.as_str().dark_grey()
        ));
    }

    fn failed(&self, name: &str, version: &str, reason: &str) {
        line(&format!("  {} {name} {version}: {reason}", "failed".red().bold()));
    }

    fn removing(&self, local: &Local) {
        line(&format!(
            "  {} {}",
            "removing".yellow(),
            local.local_path.display()
        ));
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        let noun = if count == 1 { "release" } else { "releases" };
        line(&format!(
            "\n{} {count} {noun} ({action}) in {elapsed_secs:.1}s",
            "✓".green()
        ));
    }
}

/// Ask a yes/no question on the terminal; anything but `y` is no.
pub fn confirm(question: &str) -> std::io::Result<bool> {
    let mut out = std::io::stdout();
    write!(out, "  {} {question} (y/N) ", "WARNING:".bold().red())?;
    out.flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
