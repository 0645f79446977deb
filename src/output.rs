use std::cell::RefCell;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use log::warn;

/// Where `prt` output goes. The sink is chosen once at startup and is
/// not reconfigurable mid-run.
pub trait OutputSink {
    fn print(&mut self, text: &str, end: &str);
    fn clear(&mut self);
}

/// Default sink: line-buffered standard output.
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn print(&mut self, text: &str, end: &str) {
        print!("{text}{end}");
        if std::io::stdout().flush().is_err() {
            warn!("failed to flush stdout");
        }
    }

    fn clear(&mut self) {}
}

/// Append-only log file sink.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl OutputSink for FileSink {
    fn print(&mut self, text: &str, end: &str) {
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| write!(file, "{text}{end}"));
        if let Err(err) = result {
            warn!("failed to append to {}: {err}", self.path.display());
        }
    }

    fn clear(&mut self) {}
}

/// Pixel-level rendering of the character grid happens outside this
/// crate; the display sink only maintains the text buffer.
pub trait GridRenderer {
    fn show(&mut self, rows: &[String]);
    fn clear(&mut self);
}

pub const DISPLAY_WIDTH: usize = 21;
pub const DISPLAY_HEIGHT: usize = 7;

/// Fixed-size character-grid sink: wraps at the grid width and scrolls
/// the oldest row off the top on overflow.
pub struct DisplaySink {
    width: usize,
    height: usize,
    buffer: Vec<String>,
    cur_row: usize,
    cur_col: usize,
    renderer: Box<dyn GridRenderer>,
}

impl DisplaySink {
    pub fn new(renderer: Box<dyn GridRenderer>) -> Self {
        Self {
            width: DISPLAY_WIDTH,
            height: DISPLAY_HEIGHT,
            buffer: vec![" ".repeat(DISPLAY_WIDTH); DISPLAY_HEIGHT],
            cur_row: 0,
            cur_col: 0,
            renderer,
        }
    }

    fn put_char(&mut self, c: char) {
        if self.cur_col == self.width {
            self.cur_row += 1;
            self.cur_col = 0;
        }
        if self.cur_row == self.buffer.len() {
            self.buffer.push(" ".repeat(self.width));
        }
        let row = &mut self.buffer[self.cur_row];
        let mut chars: Vec<char> = row.chars().collect();
        chars[self.cur_col] = c;
        *row = chars.into_iter().collect();
        self.cur_col += 1;
    }
}

impl OutputSink for DisplaySink {
    fn print(&mut self, text: &str, end: &str) {
        for c in text.chars().chain(end.chars()) {
            if c == '\n' {
                self.cur_row += 1;
                self.cur_col = 0;
                if self.cur_row == self.buffer.len() {
                    self.buffer.push(" ".repeat(self.width));
                }
            } else {
                self.put_char(c);
            }
        }
        if self.cur_row >= self.height {
            let overflow = self.buffer.len() - self.height;
            self.buffer.drain(..overflow);
            self.cur_row = self.height - 1;
        }
        self.renderer.show(&self.buffer);
    }

    fn clear(&mut self) {
        self.buffer = vec![" ".repeat(self.width); self.height];
        self.cur_row = 0;
        self.cur_col = 0;
        self.renderer.clear();
    }
}

/// Test/bench sink that accumulates everything printed into a shared
/// buffer.
pub struct CaptureSink {
    buffer: Rc<RefCell<String>>,
}

impl CaptureSink {
    pub fn new() -> (Self, Rc<RefCell<String>>) {
        let buffer = Rc::new(RefCell::new(String::new()));
        (
            Self {
                buffer: Rc::clone(&buffer),
            },
            buffer,
        )
    }
}

impl OutputSink for CaptureSink {
    fn print(&mut self, text: &str, end: &str) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.push_str(text);
        buffer.push_str(end);
    }

    fn clear(&mut self) {
        self.buffer.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FrameCapture {
        frames: Rc<RefCell<Vec<Vec<String>>>>,
    }

    fn capture_renderer() -> (Box<dyn GridRenderer>, Rc<RefCell<Vec<Vec<String>>>>) {
        let frames = Rc::new(RefCell::new(Vec::new()));
        (
            Box::new(FrameCapture {
                frames: Rc::clone(&frames),
            }),
            frames,
        )
    }

    impl GridRenderer for FrameCapture {
        fn show(&mut self, rows: &[String]) {
            self.frames.borrow_mut().push(rows.to_vec());
        }

        fn clear(&mut self) {}
    }

    #[test]
    fn display_places_text_on_the_grid() {
        let (renderer, frames) = capture_renderer();
        let mut sink = DisplaySink::new(renderer);
        sink.print("hi", "\n");
        let frames = frames.borrow();
        let last = frames.last().expect("one frame");
        assert_eq!(last[0], format!("hi{}", " ".repeat(DISPLAY_WIDTH - 2)));
        assert_eq!(last.len(), DISPLAY_HEIGHT);
    }

    #[test]
    fn display_wraps_at_grid_width() {
        let (renderer, frames) = capture_renderer();
        let mut sink = DisplaySink::new(renderer);
        let long = "x".repeat(DISPLAY_WIDTH + 3);
        sink.print(&long, "\n");
        let frames = frames.borrow();
        let last = frames.last().expect("one frame");
        assert_eq!(last[0], "x".repeat(DISPLAY_WIDTH));
        assert!(last[1].starts_with("xxx "));
    }

    #[test]
    fn display_scrolls_oldest_row_off_on_overflow() {
        let (renderer, frames) = capture_renderer();
        let mut sink = DisplaySink::new(renderer);
        for i in 0..DISPLAY_HEIGHT + 2 {
            sink.print(&format!("line{i}"), "\n");
        }
        let frames = frames.borrow();
        let last = frames.last().expect("frames recorded");
        assert_eq!(last.len(), DISPLAY_HEIGHT);
        assert!(last[0].starts_with("line3"));
        assert!(last[DISPLAY_HEIGHT - 2].starts_with(&format!("line{}", DISPLAY_HEIGHT + 1)));
    }

    #[test]
    fn capture_sink_accumulates_prints() {
        let (mut sink, buffer) = CaptureSink::new();
        sink.print("a", "\n");
        sink.print("b", "");
        assert_eq!(buffer.borrow().as_str(), "a\nb");
        sink.clear();
        assert!(buffer.borrow().is_empty());
    }
}
