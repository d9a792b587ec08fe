use regex::bytes::Regex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::LazyLock;
use tokio::io::{AsyncRead, AsyncReadExt};

static DEFAULT_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r?\n").expect("default line break pattern is valid"));

const READ_CHUNK: usize = 8 * 1024;

/// How a byte stream is cut into lines.
#[derive(Debug, Clone)]
pub struct FramingOptions {
    /// Pattern matching a line break.
    pub break_pattern: Regex,
    /// Suppress the empty line that would follow a break ending the input.
    pub ignore_end_of_break: bool,
    /// Drop empty lines altogether.
    pub skip_empty: bool,
}

impl Default for FramingOptions {
    fn default() -> Self {
        Self {
            break_pattern: DEFAULT_BREAK.clone(),
            ignore_end_of_break: true,
            skip_empty: false,
        }
    }
}

impl FramingOptions {
    pub fn with_break_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.break_pattern = Regex::new(pattern)?;
        Ok(self)
    }

    pub fn skip_empty(mut self, skip: bool) -> Self {
        self.skip_empty = skip;
        self
    }

    pub fn ignore_end_of_break(mut self, ignore: bool) -> Self {
        self.ignore_end_of_break = ignore;
        self
    }
}

/// Incremental line splitter with a single carry-over buffer.
///
/// The lines produced never depend on how the input was chunked: a break
/// that ends the buffer and could still grow into a longer break (`\r` under
/// `\r\n|\r|\n`) is held back until more input or `finish` settles it.
#[derive(Debug)]
pub struct LineSplitter {
    options: FramingOptions,
    carry: Vec<u8>,
    seen_input: bool,
    ended_on_break: bool,
    /// break text → whether one more byte can extend it into a longer break
    growable: HashMap<Vec<u8>, bool>,
}

impl LineSplitter {
    pub fn new(options: FramingOptions) -> Self {
        Self {
            options,
            carry: Vec::new(),
            seen_input: false,
            ended_on_break: false,
            growable: HashMap::new(),
        }
    }

    /// Feeds one chunk and returns every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.seen_input = true;
        self.carry.extend_from_slice(chunk);
        self.split(false)
    }

    fn split(&mut self, at_end: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;
        let mut held = None;
        for found in self.options.break_pattern.find_iter(&self.carry) {
            if found.start() == found.end() {
                continue;
            }
            if !at_end && found.end() == self.carry.len() {
                held = Some(found.range());
                break;
            }
            let line = &self.carry[start..found.start()];
            if !(self.options.skip_empty && line.is_empty()) {
                lines.push(String::from_utf8_lossy(line).into_owned());
            }
            start = found.end();
        }

        if let Some(range) = held {
            let tail = self.carry[range.clone()].to_vec();
            if !self.can_grow(tail) {
                let line = &self.carry[start..range.start];
                if !(self.options.skip_empty && line.is_empty()) {
                    lines.push(String::from_utf8_lossy(line).into_owned());
                }
                start = range.end;
            }
        }

        self.carry.drain(..start);
        self.ended_on_break = self.carry.is_empty();
        lines
    }

    /// Whether appending a single byte to `tail` yields a longer break.
    fn can_grow(&mut self, tail: Vec<u8>) -> bool {
        if let Some(known) = self.growable.get(&tail) {
            return *known;
        }
        let pattern = &self.options.break_pattern;
        let mut extended = tail.clone();
        extended.push(0);
        let grows = (0..=u8::MAX).any(|byte| {
            if let Some(last) = extended.last_mut() {
                *last = byte;
            }
            pattern
                .find(&extended)
                .is_some_and(|m| m.start() == 0 && m.end() > tail.len())
        });
        self.growable.insert(tail, grows);
        grows
    }

    /// Flushes the buffered input at end of stream and resets the splitter.
    pub fn finish(&mut self) -> Vec<String> {
        let mut lines = if self.carry.is_empty() {
            Vec::new()
        } else {
            self.split(true)
        };

        if !self.carry.is_empty() {
            lines.push(String::from_utf8_lossy(&self.carry).into_owned());
        } else if self.seen_input
            && self.ended_on_break
            && !self.options.ignore_end_of_break
            && !self.options.skip_empty
        {
            lines.push(String::new());
        }

        self.carry.clear();
        self.seen_input = false;
        self.ended_on_break = false;
        lines
    }

    /// Bytes waiting for a line break.
    pub fn buffered(&self) -> usize {
        self.carry.len()
    }
}

/// Lazy async sequence of lines read from `R`.
///
/// The sequence is finite when the source ends; read errors are returned as-is.
pub struct LineReader<R> {
    reader: R,
    splitter: LineSplitter,
    ready: VecDeque<String>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, options: FramingOptions) -> Self {
        Self {
            reader,
            splitter: LineSplitter::new(options),
            ready: VecDeque::new(),
            buf: vec![0u8; READ_CHUNK],
            done: false,
        }
    }

    /// Next complete line, or `None` once the source is exhausted.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.done {
                return Ok(None);
            }

            let read = self.reader.read(&mut self.buf).await?;
            if read == 0 {
                self.done = true;
                let rest = self.splitter.finish();
                self.ready.extend(rest);
                continue;
            }

            let lines = self.splitter.push(&self.buf[..read]);
            self.ready.extend(lines);
        }
    }
}
