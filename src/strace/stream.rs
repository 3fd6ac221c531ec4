use std::{
    borrow::Cow,
    collections::HashMap,
    io::{BufRead, Write},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bstr::ByteSlice as _;

use crate::{Pid, event::TraceEvent};

use super::{LineSourceLocation, analyzer::Analyzer, parser::parse_line};

/// The tracer's output as a lazy sequence of events. The sequence ends when
/// the underlying reader reaches EOF and cannot be restarted.
pub struct TraceStream<R> {
    lines: std::io::Split<R>,
    filename: String,
    line_index: usize,
    analyzer: Analyzer,
    unfinished: HashMap<Pid, String>,
    tee: Option<Box<dyn Write + Send>>,
    skipped: Arc<AtomicUsize>,
    finished: bool,
}

impl<R: BufRead> TraceStream<R> {
    pub fn new(reader: R, filename: impl Into<String>) -> Self {
        Self {
            lines: reader.split(b'\n'),
            filename: filename.into(),
            line_index: 0,
            analyzer: Analyzer::default(),
            unfinished: HashMap::new(),
            tee: None,
            skipped: Arc::new(AtomicUsize::new(0)),
            finished: false,
        }
    }

    /// Copy every raw line to `writer` before it is parsed.
    pub fn with_tee(mut self, writer: impl Write + Send + 'static) -> Self {
        self.tee = Some(Box::new(writer));
        self
    }

    /// Number of lines dropped as malformed so far.
    pub fn skipped_lines(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    /// A handle on the malformed-line counter that stays readable after the
    /// stream has moved to another thread.
    pub fn skew_counter(&self) -> Arc<AtomicUsize> {
        self.skipped.clone()
    }

    /// Look at the next event without consuming it, reading as much input as
    /// needed.
    pub fn peek(&mut self) -> Option<&TraceEvent> {
        while !self.analyzer.has_events() {
            if !self.read_line() {
                return None;
            }
        }

        self.analyzer.peek_event()
    }

    fn read_line(&mut self) -> bool {
        if self.finished {
            return false;
        }

        let line = match self.lines.next() {
            Some(Ok(line)) => line,
            Some(Err(error)) => {
                tracing::warn!(%error, "failed to read strace output");
                self.finish();
                return false;
            }
            None => {
                self.finish();
                return false;
            }
        };
        let line_index = self.line_index;
        self.line_index += 1;

        if let Some(tee) = &mut self.tee {
            let result = tee.write_all(&line).and_then(|()| tee.write_all(b"\n"));
            if let Err(error) = result {
                tracing::warn!(%error, "failed to copy strace output, disabling copy");
                self.tee = None;
            }
        }

        let line = line.to_str_lossy();
        let Some(line) = self.stitch(&line, line_index) else {
            return true;
        };

        let location = LineSourceLocation {
            filename: &self.filename,
            line_index,
        };
        match parse_line(&line, &location) {
            Ok(line) => self.analyzer.push_line(line),
            Err(error) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                let report = miette::Report::new(error);
                tracing::debug!(line_index, "skipping strace line: {report:?}");
            }
        }

        true
    }

    /// Join `<unfinished ...>` lines with their `<... resumed>` half. Returns
    /// `None` while a line is held back or was discarded.
    fn stitch<'a>(&mut self, line: &'a str, line_index: usize) -> Option<Cow<'a, str>> {
        let line = line.trim_end();
        if line.is_empty() {
            return None;
        }

        if let Some(prefix) = line.strip_suffix("<unfinished ...>") {
            let pid = prefix
                .split(' ')
                .next()
                .and_then(|pid| pid.parse::<Pid>().ok());
            if let Some(pid) = pid {
                let stale = self.unfinished.insert(pid, prefix.trim_end().to_string());
                if stale.is_some() {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                }
                return None;
            }

            return Some(Cow::Borrowed(line));
        }

        if let Some((pid, rest)) = line.split_once(' ')
            && let Some((_timestamp, rest)) = rest.trim_start().split_once(' ')
            && let Some(rest) = rest.strip_prefix("<... ")
        {
            let prefix = pid
                .parse::<Pid>()
                .ok()
                .and_then(|pid| self.unfinished.remove(&pid));
            let tail = rest.split_once(" resumed>").map(|(_, tail)| tail);

            return match (prefix, tail) {
                (Some(prefix), Some(tail)) => Some(Cow::Owned(format!("{prefix}{tail}"))),
                _ => {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(line_index, "skipping resumed strace line without its start");
                    None
                }
            };
        }

        Some(Cow::Borrowed(line))
    }

    fn finish(&mut self) {
        self.finished = true;

        // Calls that never resumed, e.g. because the process was killed
        if !self.unfinished.is_empty() {
            tracing::debug!(count = self.unfinished.len(), "dropping unfinished syscalls");
            self.skipped
                .fetch_add(self.unfinished.len(), Ordering::Relaxed);
            self.unfinished.clear();
        }

        if let Some(tee) = &mut self.tee
            && let Err(error) = tee.flush()
        {
            tracing::warn!(%error, "failed to flush strace output copy");
        }
    }
}

impl<R: BufRead> Iterator for TraceStream<R> {
    type Item = TraceEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.analyzer.pop_event() {
                return Some(event);
            }

            if !self.read_line() {
                return None;
            }
        }
    }
}
