use std::fmt::Display;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use nu_ansi_term::{Color, Style};

/// Whether terminal output is coloured.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Theme {
    /// Colour when stdout is a terminal.
    Auto,
    /// Never colour.
    Plain,
}

/// Terminal output of the CLI. Quiet mode drops decoration and progress.
pub struct Ui {
    styles: Option<Styles>,
    quiet: bool,
}

struct Styles {
    heading: Style,
    key: Style,
    ok: Style,
    warn: Style,
}

impl Ui {
    pub fn new(theme: Theme, quiet: bool) -> Self {
        let colour = theme == Theme::Auto && !quiet && std::io::stdout().is_terminal();
        let styles = colour.then(|| Styles {
            heading: Style::new().fg(Color::Cyan).bold(),
            key: Style::new().bold(),
            ok: Style::new().fg(Color::Green),
            warn: Style::new().fg(Color::Yellow).bold(),
        });
        Self { styles, quiet }
    }

    pub fn spacer(&self) {
        if !self.quiet {
            println!();
        }
    }

    /// Aligned `key: value` block under a heading.
    pub fn section<'a, I, V>(&self, title: &str, rows: I)
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: Display,
    {
        let rows: Vec<(&str, String)> = rows
            .into_iter()
            .map(|(key, value)| (key, value.to_string()))
            .collect();
        if rows.is_empty() {
            return;
        }
        self.heading(title);
        let width = rows.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
        for (key, value) in rows {
            let key = format!("{key:>width$}:");
            println!("  {} {value}", self.paint(|s| s.key, &key));
        }
    }

    /// Fixed-width table; the first row is the header.
    pub fn table(&self, title: &str, rows: &[Vec<String>]) {
        let Some(header) = rows.first() else {
            return;
        };
        self.heading(title);
        let widths: Vec<usize> = (0..header.len())
            .map(|col| rows.iter().map(|row| row[col].len()).max().unwrap_or(0))
            .collect();
        for (i, row) in rows.iter().enumerate() {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ");
            let line = line.trim_end();
            if i == 0 {
                println!("  {}", self.paint(|s| s.key, line));
            } else {
                println!("  {line}");
            }
        }
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("  {message}");
        }
    }

    pub fn success(&self, message: &str) {
        println!("{} {message}", self.paint(|s| s.ok, "done:"));
    }

    pub fn warn(&self, message: &str) {
        eprintln!("{} {message}", self.paint(|s| s.warn, "warning:"));
    }

    /// Bar advanced once per finished cell, drawn on stderr next to the logs.
    pub fn sweep_bar(&self) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::with_template(
            "[{elapsed_precise}] {wide_bar} {pos}/{len} cells  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(250));
        bar
    }

    /// Spinner for a single blocking step; `finish` returns its duration.
    pub fn timed(&self, label: impl Into<String>) -> Timed {
        let spinner = (!self.quiet).then(|| {
            let spinner = ProgressBar::new_spinner();
            spinner.set_message(label.into());
            spinner.enable_steady_tick(Duration::from_millis(120));
            spinner
        });
        Timed {
            spinner,
            started: Instant::now(),
        }
    }

    fn heading(&self, title: &str) {
        println!("{}", self.paint(|s| s.heading, title));
    }

    fn paint(&self, pick: impl Fn(&Styles) -> Style, text: &str) -> String {
        match &self.styles {
            Some(styles) => pick(styles).paint(text).to_string(),
            None => text.to_string(),
        }
    }
}

pub struct Timed {
    spinner: Option<ProgressBar>,
    started: Instant,
}

impl Timed {
    pub fn finish(self) -> Duration {
        if let Some(spinner) = self.spinner {
            spinner.finish_and_clear();
        }
        self.started.elapsed()
    }
}

/// `850ms`, `4.20s` or `12m03s`.
pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1_000.0)
    } else if secs < 60.0 {
        format!("{secs:.2}s")
    } else {
        let whole = duration.as_secs();
        format!("{}m{:02}s", whole / 60, whole % 60)
    }
}
