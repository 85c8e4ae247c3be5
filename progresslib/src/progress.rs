pub mod format;

use format::{BinarySize, ClockDuration, ShortDuration};

use std::{
    io::{self, Write},
    time::{Duration, Instant},
};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    QueueableCommand,
    style::{Print, Stylize},
    terminal::{self, Clear, ClearType},
    tty::IsTty,
};

/// How the progress bar should be drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressDrawMode {
    /// Overwrite the same line on every frame. For interactive terminals.
    /// Defaults to 15 fps.
    Interactive,
    /// Append a new line on every frame. For redirected output or when log
    /// messages are interleaved. Defaults to 0.2 fps.
    Append,
    /// Do not draw anything.
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

/// Progress bar for a sequence of labelled phases, each measured in bytes.
/// The speed is supplied by the caller along with each position update, so
/// the bar only renders. Each frame shows the time spent in the current
/// phase, the bar, the percentage, the position, the speed, the ETA and the
/// phase label.
pub struct ProgressBar<T: Write + IsTty> {
    label: String,
    len: u64,
    pos: u64,
    /// Units per second, as last reported
    speed: u64,
    term: T,
    mode: ProgressDrawMode,
    /// (Maximum) frames per second for rendering
    fps: f64,
    last_draw: Option<Instant>,
    /// Start of the current phase
    started: Instant,
}

impl<T: Write + IsTty> ProgressBar<T> {
    /// Construct a progress bar with no phase. Nothing is drawn until
    /// [`Self::set_phase`] is called.
    pub fn new(term: T) -> Self {
        let mode = ProgressDrawMode::for_term(&term);

        Self {
            label: String::new(),
            len: 0,
            pos: 0,
            speed: 0,
            term,
            mode,
            fps: mode.default_fps(),
            last_draw: None,
            started: Instant::now(),
        }
    }

    pub fn mode(&self) -> ProgressDrawMode {
        self.mode
    }

    /// Set the draw mode, or pick one based on whether the terminal is
    /// interactive if `None`. Resets the fps to the mode's default.
    pub fn set_mode(&mut self, mode: Option<ProgressDrawMode>) {
        self.mode = mode.unwrap_or_else(|| ProgressDrawMode::for_term(&self.term));
        self.fps = self.mode.default_fps();
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Set maximum rendering frequency in frames per second. 0 disables rate
    /// limiting.
    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn length(&self) -> u64 {
        self.len
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Start a new phase. The elapsed time and position are reset and the
    /// bar is redrawn immediately.
    pub fn set_phase(&mut self, label: &str, len: u64) -> io::Result<()> {
        self.label = label.to_owned();
        self.len = len;
        self.pos = 0;
        self.speed = 0;
        self.started = Instant::now();
        self.draw(true)
    }

    /// Update the position within the current phase. Redraws are rate limited,
    /// except for the final position.
    pub fn set_progress(&mut self, pos: u64, speed: u64) -> io::Result<()> {
        self.pos = pos;
        self.speed = speed;
        self.draw(pos >= self.len)
    }

    /// Print a line without clobbering the progress bar.
    pub fn println(&mut self, msg: impl Into<String>) -> io::Result<()> {
        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        if self.mode == ProgressDrawMode::Interactive {
            self.term
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?;
        }

        self.term
            .queue(Print(msg.into()))?
            .queue(Print('\n'))?;

        if self.mode == ProgressDrawMode::Interactive && self.last_draw.is_some() {
            self.draw(true)
        } else {
            self.term.flush()
        }
    }

    /// Keep the current frame on screen in interactive mode. Later frames
    /// are drawn on the next line.
    pub fn keep(&mut self) -> io::Result<()> {
        if self.mode == ProgressDrawMode::Interactive && self.last_draw.is_some() {
            self.term
                .queue(Print('\n'))?
                .flush()?;
            self.last_draw = None;
        }
        Ok(())
    }

    /// Remove the progress bar from the terminal. Called automatically when
    /// the progress bar is dropped.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.mode == ProgressDrawMode::Interactive && self.last_draw.is_some() {
            self.term
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?
                .queue(Show)?
                .flush()?;
            self.last_draw = None;
        }
        Ok(())
    }

    fn eta(&self) -> Duration {
        if self.speed > 0 {
            Duration::from_secs(self.len.saturating_sub(self.pos) / self.speed)
        } else {
            Duration::ZERO
        }
    }

    fn render(&self) -> String {
        let ratio = if self.len == 0 {
            0.0
        } else {
            (self.pos as f64 / self.len as f64).clamp(0.0, 1.0)
        };

        let mut line = format!(
            "[{elapsed}] {bar}{percent:.0}% {pos}/{len} ({speed}/s, {eta}) {label}",
            elapsed = ClockDuration(self.started.elapsed()),
            bar = if self.mode == ProgressDrawMode::Interactive { "\x00" } else { "" },
            percent = ratio * 100.0,
            pos = BinarySize(self.pos),
            len = BinarySize(self.len),
            speed = BinarySize(self.speed),
            eta = ShortDuration(self.eta()),
            label = self.label,
        );

        if self.mode == ProgressDrawMode::Interactive {
            let term_width = terminal::size().map_or(80, |s| s.0) as usize;
            // The placeholder counts as the space after the bar
            let bar_width = term_width.saturating_sub(line.chars().count());

            let bar = if bar_width == 0 {
                String::new()
            } else {
                let consumed = (ratio * bar_width as f64).round() as usize;
                format!(
                    "{}{} ",
                    "#".repeat(consumed).cyan(),
                    "-".repeat(bar_width - consumed).blue(),
                )
            };
            line = line.replace('\x00', &bar);
        }

        line
    }

    /// Draw the current state. Unless `force` is set, this is subject to the
    /// fps limit.
    pub fn draw(&mut self, force: bool) -> io::Result<()> {
        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        if let (false, Some(last)) = (force, self.last_draw) {
            if self.fps > 0.0 && last.elapsed() < Duration::from_secs_f64(1.0 / self.fps) {
                return Ok(());
            }
        }

        let line = self.render();

        if self.mode == ProgressDrawMode::Interactive {
            self.term
                .queue(Hide)?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?
                .queue(Print(line))?;
        } else {
            self.term
                .queue(Print(line))?
                .queue(Print('\n'))?;
        }

        self.term.flush()?;
        self.last_draw = Some(Instant::now());

        Ok(())
    }
}

impl<T: Write + IsTty> Drop for ProgressBar<T> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        rc::Rc,
        cell::RefCell,
        str,
    };

    use super::*;

    struct TestTerm {
        buf: Rc<RefCell<String>>,
        tty: bool,
    }

    impl TestTerm {
        fn new(tty: bool) -> Self {
            Self {
                buf: Rc::new(RefCell::new(String::new())),
                tty,
            }
        }
    }

    impl Write for TestTerm {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let s = str::from_utf8(buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.buf.borrow_mut().push_str(s);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl IsTty for TestTerm {
        fn is_tty(&self) -> bool {
            self.tty
        }
    }

    fn take(buf: &Rc<RefCell<String>>) -> String {
        buf.borrow_mut().split_off(0)
    }

    #[test]
    fn test_mode_none_draws_nothing() {
        let term = TestTerm::new(true);
        let buf = term.buf.clone();
        let mut bar = ProgressBar::new(term);

        bar.set_mode(Some(ProgressDrawMode::None));
        assert_eq!(bar.fps(), 0.0);

        bar.set_phase("Downloading", 10).unwrap();
        bar.set_progress(5, 1).unwrap();
        bar.println("hello").unwrap();
        assert_eq!(bar.position(), 5);
        drop(bar);

        assert_eq!(*buf.borrow(), "");
    }

    #[test]
    fn test_append() {
        let term = TestTerm::new(false);
        let buf = term.buf.clone();
        let mut bar = ProgressBar::new(term);

        assert_eq!(bar.mode(), ProgressDrawMode::Append);
        assert_eq!(bar.fps(), 0.2);
        bar.set_fps(0.0);

        bar.set_phase("Downloading", 10).unwrap();
        let output = take(&buf);
        let pieces: Vec<&str> = output.trim_end().split(' ').collect();
        assert_eq!(pieces[1..], ["0%", "0B/10B", "(0B/s,", "0s)", "Downloading"]);

        bar.set_progress(4, 2).unwrap();
        let output = take(&buf);
        let pieces: Vec<&str> = output.trim_end().split(' ').collect();
        assert_eq!(pieces[1..], ["40%", "4B/10B", "(2B/s,", "3s)", "Downloading"]);

        bar.println("hello").unwrap();
        assert_eq!(take(&buf), "hello\n");

        bar.set_phase("Verifying CRC32", 20).unwrap();
        assert!(take(&buf).ends_with("0B/20B (0B/s, 0s) Verifying CRC32\n"));
        assert_eq!(bar.label(), "Verifying CRC32");
        assert_eq!(bar.length(), 20);

        drop(bar);
        assert_eq!(*buf.borrow(), "");
    }

    #[test]
    fn test_rate_limit() {
        let term = TestTerm::new(false);
        let buf = term.buf.clone();
        let mut bar = ProgressBar::new(term);
        bar.set_fps(0.001);

        bar.set_phase("Decrypting", 10).unwrap();
        take(&buf);

        bar.set_progress(1, 0).unwrap();
        assert_eq!(*buf.borrow(), "");

        // The final position is always drawn
        bar.set_progress(10, 0).unwrap();
        assert!(take(&buf).contains("100% 10B/10B"));
    }

    #[test]
    fn test_interactive() {
        let term = TestTerm::new(true);
        let buf = term.buf.clone();
        let mut bar = ProgressBar::new(term);

        assert_eq!(bar.mode(), ProgressDrawMode::Interactive);
        assert_eq!(bar.fps(), 15.0);
        bar.set_fps(0.0);

        // Nothing to clear before the first frame
        bar.finish().unwrap();
        assert_eq!(*buf.borrow(), "");

        bar.set_phase("Downloading", 10).unwrap();
        bar.set_progress(10, 5).unwrap();
        let output = take(&buf);
        let pieces: Vec<&str> = output.split(' ').collect();
        assert!(pieces.contains(&"100%"));
        assert!(pieces.contains(&"10B/10B"));
        assert!(output.ends_with("Downloading"));

        bar.keep().unwrap();
        assert_eq!(take(&buf), "\n");

        bar.println("hello").unwrap();
        assert!(take(&buf).ends_with("hello\n"));

        bar.set_progress(10, 5).unwrap();
        take(&buf);
        drop(bar);
        assert!(!buf.borrow().is_empty());
    }
}
