mod format;

use format::ClockDuration;

use std::{
    collections::VecDeque,
    io::Write,
    time::{Duration, Instant},
};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    style::{Print, Stylize},
    terminal::{self, Clear, ClearType},
    tty::IsTty,
    QueueableCommand,
    Result,
};

/// Keeps the percentages reported over a sliding window of time to estimate
/// how fast the transfer is moving.
#[derive(Debug)]
struct ProgressRate {
    window: Duration,
    samples: VecDeque<(Instant, u8)>,
}

impl ProgressRate {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    fn reset(&mut self) {
        self.samples.clear();
    }

    fn record(&mut self, percent: u8) {
        let now = Instant::now();
        self.samples.push_back((now, percent));

        // Keep one sample older than the window as the baseline
        while self.samples.len() > 2 && now - self.samples[1].0 >= self.window {
            self.samples.pop_front();
        }
    }

    /// Percentage points per second.
    fn per_sec(&self) -> f64 {
        if let (Some(f), Some(b)) = (self.samples.front(), self.samples.back()) {
            let elapsed = (b.0 - f.0).as_secs_f64();
            if elapsed > 0.0 && b.1 > f.1 {
                return f64::from(b.1 - f.1) / elapsed;
            }
        }

        0.0
    }
}

/// Progress bar for a task that reports a percentage, such as a firmware
/// transfer. The elapsed time, a label, the percentage, and an ETA are shown.
pub struct ProgressBar<T: Write + IsTty> {
    /// Shown before the bar, usually the item being transferred
    label: String,
    /// Current value in `0..=100`
    percent: u8,
    term: T,
    mode: ProgressDrawMode,
    /// (Maximum) frames per second for rendering
    fps: f64,
    last_draw: Instant,
    started: Instant,
    rate: ProgressRate,
}

/// How the progress bar should be drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressDrawMode {
    /// Overwrite the same line on every frame. Useful when the terminal is
    /// interactive. Renders at up to 15 fps by default.
    Interactive,
    /// Append a new line on every frame. Useful when output is redirected or
    /// interleaved with logs. Renders at up to 0.2 fps by default.
    Append,
    /// Do not draw to the terminal.
    None,
}

impl ProgressDrawMode {
    fn default_fps(self) -> f64 {
        match self {
            Self::Interactive => 15.0,
            Self::Append => 0.2,
            Self::None => 0.0,
        }
    }

    fn for_term(term: &impl IsTty) -> Self {
        if term.is_tty() {
            Self::Interactive
        } else {
            Self::Append
        }
    }
}

impl<T: Write + IsTty> ProgressBar<T> {
    /// Construct a new progress bar at 0%. Nothing is drawn until the first
    /// update.
    pub fn new(term: T) -> Self {
        let mode = ProgressDrawMode::for_term(&term);
        let now = Instant::now();

        Self {
            label: String::new(),
            percent: 0,
            term,
            mode,
            fps: mode.default_fps(),
            last_draw: now,
            started: now,
            rate: ProgressRate::new(Duration::from_secs(10)),
        }
    }

    pub fn mode(&self) -> ProgressDrawMode {
        self.mode
    }

    /// Set the draw mode. `None` picks [`ProgressDrawMode::Interactive`] or
    /// [`ProgressDrawMode::Append`] depending on whether the terminal is
    /// interactive. This resets the fps to the mode's default.
    pub fn set_mode(&mut self, mode: Option<ProgressDrawMode>) {
        self.mode = mode.unwrap_or_else(|| ProgressDrawMode::for_term(&self.term));
        self.fps = self.mode.default_fps();
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Set maximum rendering frequency in frames per second.
    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Set the label. This performs an immediate redraw.
    pub fn set_label<I: Into<String>>(&mut self, label: I) -> Result<()> {
        self.label = label.into();
        self.draw(true)
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Set the current percentage, clamped to 100. Reaching 100% is always
    /// drawn. Other values are subject to the output rate limiting.
    pub fn set_percent(&mut self, percent: u8) -> Result<()> {
        self.percent = percent.min(100);
        self.rate.record(self.percent);
        self.draw(self.percent == 100)
    }

    /// Print a line to the progress bar's terminal without clobbering the
    /// progress bar itself.
    pub fn println<I: Into<String>>(&mut self, msg: I) -> Result<()> {
        if self.mode != ProgressDrawMode::None {
            if self.mode == ProgressDrawMode::Interactive {
                self.term
                    .queue(Clear(ClearType::CurrentLine))?
                    .queue(MoveToColumn(0))?;
            }

            self.term
                .queue(Print(msg.into()))?
                .queue(Print('\n'))?;

            if self.mode == ProgressDrawMode::Interactive {
                self.draw(true)?;
            } else {
                self.term.flush()?;
            }
        }
        Ok(())
    }

    /// Clear the progress bar from an interactive terminal, or draw the final
    /// frame otherwise. The bar reappears on the next update. This is
    /// automatically called when the progress bar is dropped.
    pub fn finish(&mut self) -> Result<()> {
        match self.mode {
            ProgressDrawMode::Interactive => {
                self.term
                    .queue(Clear(ClearType::CurrentLine))?
                    .queue(MoveToColumn(0))?
                    .queue(Show)?
                    .flush()?;
            }
            ProgressDrawMode::Append => self.draw(true)?,
            ProgressDrawMode::None => {}
        }
        Ok(())
    }

    /// On an interactive terminal, move to a new line so the current state
    /// stays on screen.
    pub fn keep(&mut self) -> Result<()> {
        if self.mode == ProgressDrawMode::Interactive {
            self.term
                .queue(Print('\n'))?
                .flush()?;
        }
        Ok(())
    }

    /// Start over at 0% with a new label and a fresh clock. This performs an
    /// immediate redraw.
    pub fn reset<I: Into<String>>(&mut self, label: I) -> Result<()> {
        self.label = label.into();
        self.percent = 0;
        self.started = Instant::now();
        self.rate.reset();
        self.draw(true)
    }

    /// Draw the progress bar. If `force` is false, the draw is subject to the
    /// rate limit.
    pub fn draw(&mut self, force: bool) -> Result<()> {
        if !force && self.fps > 0.0 {
            let frame_dur = Duration::from_secs_f64(1.0 / self.fps);
            if self.last_draw != self.started && self.last_draw.elapsed() < frame_dur {
                return Ok(());
            }
        }

        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        let elapsed = Duration::from_secs(self.started.elapsed().as_secs());
        let interactive = self.mode == ProgressDrawMode::Interactive;

        let mut result = format!("[{}] ", ClockDuration(elapsed));
        if !self.label.is_empty() {
            result.push_str(&self.label);
            result.push(' ');
        }
        if interactive {
            result.push('\x00');
        }
        result.push_str(&format!("{}%", self.percent));
        if let Some(eta) = self.eta() {
            result.push_str(&format!(" ETA {}", ClockDuration(eta)));
        }

        if interactive {
            let term_width = terminal::size().unwrap_or((80, 24)).0 as usize;
            // The placeholder stands in for the space after the bar
            let bar_width = term_width.saturating_sub(result.len());
            let bar_consumed = bar_width * usize::from(self.percent) / 100;
            let bar_remaining = bar_width - bar_consumed;

            result = if bar_width != 0 {
                result.replace('\x00', &format!(
                    "{}{} ",
                    "#".repeat(bar_consumed).cyan(),
                    "-".repeat(bar_remaining).blue(),
                ))
            } else {
                result.replace('\x00', "")
            };

            self.term
                .queue(Hide)?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?;
        } else {
            result.push('\n');
        }

        self.term
            .queue(Print(result))?
            .flush()?;

        self.last_draw = Instant::now();

        Ok(())
    }

    /// Estimated time to reach 100%, once the rate is known.
    fn eta(&self) -> Option<Duration> {
        let rate = self.rate.per_sec();
        if rate > 0.0 && self.percent < 100 {
            let secs = f64::from(100 - self.percent) / rate;
            Some(Duration::from_secs(secs as u64))
        } else {
            None
        }
    }
}

impl<T: Write + IsTty> Drop for ProgressBar<T> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}
