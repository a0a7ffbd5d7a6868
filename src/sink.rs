//! Log/Detail sink.
//!
//! Process output is streamed into named buffers as it is produced. Callers
//! get at it through [`Detail`]s: named attachments that render lazily, so a
//! detail taken before a failure still shows everything captured up to the
//! moment it is rendered.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::debug;

/// Standard stream of the service process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    pub stream: Stream,
    pub text: String,
}

#[derive(Default)]
struct Buffer {
    lines: Vec<CapturedLine>,
}

/// Ordered, append-only capture of one service's output.
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct OutputSink {
    service: Arc<str>,
    buffer: Arc<Mutex<Buffer>>,
}

impl OutputSink {
    pub fn new(service: &str) -> Self {
        Self {
            service: Arc::from(service),
            buffer: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, stream: Stream, text: impl Into<String>) {
        let text = text.into();
        debug!(service = %self.service, %stream, "{}", text);
        self.lock().lines.push(CapturedLine { stream, text });
    }

    /// Stream `reader` into the buffer line by line until EOF.
    ///
    /// Must be called from inside a Tokio runtime; the copy runs as a task on
    /// it. Invalid UTF-8 is replaced rather than dropped.
    pub fn capture<R>(&self, stream: Stream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {
                        while matches!(raw.last(), Some(b'\n' | b'\r')) {
                            raw.pop();
                        }
                        sink.push(stream, String::from_utf8_lossy(&raw).into_owned());
                    }
                    Err(e) => {
                        debug!(service = %sink.service, %stream, error = %e, "capture ended with read error");
                        break;
                    }
                }
            }
        })
    }

    pub fn line_count(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line_count() == 0
    }

    /// Lines captured at index `cursor` and later.
    pub fn lines_since(&self, cursor: usize) -> Vec<CapturedLine> {
        let buf = self.lock();
        buf.lines.get(cursor..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn lines(&self) -> Vec<CapturedLine> {
        self.lines_since(0)
    }

    /// Render one stream, or both interleaved with a stream prefix.
    pub fn render(&self, stream: Option<Stream>) -> String {
        let buf = self.lock();
        let mut out = String::new();
        for line in &buf.lines {
            match stream {
                Some(s) if s != line.stream => continue,
                Some(_) => {}
                None => {
                    out.push_str(line.stream.as_str());
                    out.push_str(": ");
                }
            }
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }

    /// A lazily rendered detail over this buffer.
    pub fn attach(&self, name: impl Into<String>, stream: Option<Stream>) -> Detail {
        let sink = self.clone();
        Detail::new(name, move || sink.render(stream))
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("service", &self.service)
            .field("lines", &self.line_count())
            .finish()
    }
}

type Render = dyn Fn() -> String + Send + Sync;

/// A named artifact retrievable after a run, rendered on demand.
#[derive(Clone)]
pub struct Detail {
    name: String,
    render: Arc<Render>,
}

impl Detail {
    pub fn new<F>(name: impl Into<String>, render: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            render: Arc::new(render),
        }
    }

    /// A detail whose content is fixed now.
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(name, move || text.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render(&self) -> String {
        (self.render)()
    }
}

// Never prints content.
impl fmt::Debug for Detail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detail").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Named details attached to one supervisor.
#[derive(Debug, Clone, Default)]
pub struct Details {
    entries: BTreeMap<String, Detail>,
}

impl Details {
    /// Replaces any earlier detail of the same name.
    pub fn attach(&mut self, detail: Detail) {
        self.entries.insert(detail.name().to_string(), detail);
    }

    pub fn get(&self, name: &str) -> Option<&Detail> {
        self.entries.get(name)
    }

    pub fn render(&self, name: &str) -> Option<String> {
        self.get(name).map(Detail::render)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Detail> {
        self.entries.values()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
