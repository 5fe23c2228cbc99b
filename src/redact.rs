//! Secret masking for everything the bosh CLI prints.
//!
//! Output is redacted line by line with exact substring matches of known
//! secret values, all compiled into a single escaped alternation. [`RedactingWriter`] is the only path by which child output
//! reaches a buffer or a sink, so captured and streamed bytes are always the
//! same redacted bytes in the same order.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use regex::bytes::{NoExpand, Regex, RegexBuilder};

use crate::error::{DeployResourceError, Result};

/// The replacement text for redacted secrets.
pub const REDACTED: &str = "[REDACTED]";

const MATCHER_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Shared operator-visible destination (stderr in production).
pub type SharedSink = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn shared_sink<W: Write + Send + 'static>(writer: W) -> SharedSink {
    Arc::new(Mutex::new(Box::new(writer)))
}

pub fn stderr_sink() -> SharedSink {
    shared_sink(io::stderr())
}

/// Set of secret values to mask, compiled into one matcher.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
    matcher: Option<Regex>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::default().with(secrets)
    }

    /// Returns a redactor masking both the current and the extra secrets.
    pub fn with<I, S>(&self, extra: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut secrets = self.secrets.clone();
        for secret in extra {
            // Multi-line secrets (private keys, certs) can only ever match one line at a time.
            for line in secret.as_ref().lines() {
                let line = line.trim_end_matches('\r');
                if !line.is_empty() && !secrets.iter().any(|known| known == line) {
                    secrets.push(line.to_string());
                }
            }
        }
        // Alternation is leftmost-first, so longest first masks a secret containing another whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));

        let matcher = if secrets.is_empty() {
            None
        } else {
            let pattern = secrets
                .iter()
                .map(|secret| regex::escape(secret))
                .collect::<Vec<_>>()
                .join("|");
            let regex = RegexBuilder::new(&pattern)
                .size_limit(MATCHER_SIZE_LIMIT)
                .build()
                .map_err(|err| {
                    DeployResourceError::Other(format!("cannot build secret matcher: {err}"))
                })?;
            Some(regex)
        };
        Ok(Self { secrets, matcher })
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact(&self, text: &str) -> String {
        String::from_utf8_lossy(&self.redact_bytes(text.as_bytes())).into_owned()
    }

    pub fn redact_bytes(&self, input: &[u8]) -> Vec<u8> {
        match &self.matcher {
            Some(matcher) => matcher
                .replace_all(input, NoExpand(REDACTED.as_bytes()))
                .into_owned(),
            None => input.to_vec(),
        }
    }
}

/// Buffers everything written and optionally forwards it to a shared sink.
pub struct Tee {
    buffer: Vec<u8>,
    sink: Option<SharedSink>,
}

impl Tee {
    pub fn new(sink: Option<SharedSink>) -> Self {
        Self {
            buffer: Vec::new(),
            sink,
        }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        if let Some(sink) = &self.sink {
            let mut sink = sink
                .lock()
                .map_err(|_| io::Error::other("output sink lock poisoned"))?;
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(sink) = &self.sink {
            let mut sink = sink
                .lock()
                .map_err(|_| io::Error::other("output sink lock poisoned"))?;
            sink.flush()?;
        }
        Ok(())
    }
}

/// Holds bytes until a full line is available, then writes the redacted line through.
pub struct RedactingWriter<W: Write> {
    redactor: Redactor,
    pending: Vec<u8>,
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(redactor: Redactor, inner: W) -> Self {
        Self {
            redactor,
            pending: Vec::new(),
            inner,
        }
    }

    /// Flushes the trailing partial line (if any) and returns the wrapped writer.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.inner.write_all(&self.redactor.redact_bytes(&rest))?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.inner.write_all(&self.redactor.redact_bytes(&line))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial lines stay pending: flushing them early could split a secret.
        self.inner.flush()
    }
}
