use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    fn parse(flag: Option<&str>) -> Self {
        match flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

/// Stage reporting on stderr; stdout stays reserved for profile JSON.
#[derive(Clone, Debug)]
pub struct Ui {
    spinners: bool,
}

impl Ui {
    pub fn from_args(ui_flag: Option<&str>, stderr_is_tty: bool) -> Self {
        let spinners = match UiMode::parse(ui_flag) {
            UiMode::Plain => false,
            UiMode::Auto | UiMode::Pretty => stderr_is_tty,
        };
        Self { spinners }
    }

    pub fn stage(&self, name: &str) -> Stage {
        let spinner = self.spinners.then(|| {
            let spinner = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.enable_steady_tick(Duration::from_millis(100));
            spinner.set_message(name.to_string());
            spinner
        });
        if spinner.is_none() {
            eprintln!("==> {}", name);
        }
        Stage {
            name: name.to_string(),
            detail: None,
            start: Instant::now(),
            spinner,
        }
    }
}

/// One running stage. Reports its duration, and an optional outcome, when dropped.
pub struct Stage {
    name: String,
    detail: Option<String>,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl Stage {
    /// Outcome shown next to the stage name once it finishes.
    pub fn detail(&mut self, detail: impl Into<String>) {
        self.detail = Some(detail.into());
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let took = if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        };
        let line = match &self.detail {
            Some(detail) => format!("✔ {}: {} ({})", self.name, detail, took),
            None => format!("✔ {} ({})", self.name, took),
        };
        match self.spinner.take() {
            Some(spinner) => spinner.finish_with_message(line),
            None => eprintln!("{line}"),
        }
    }
}
