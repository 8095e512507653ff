//! Forwards worker stdout/stderr to the supervisor, one tagged line at a time.
//!
//! Every pipe becomes a stream in a [`StreamMap`]. A batch waits up to a
//! timeout for the first chunk, then drains whatever else is ready without
//! blocking. Pipes that close (EOF or broken pipe) leave the map on their own.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::time::Duration;

use futures::{FutureExt, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_stream::{StreamExt, StreamMap};
use tracing::warn;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pipe {
    Stdout,
    Stderr,
}

/// Which worker pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogSource {
    pub worker: usize,
    pub pipe: Pipe,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pipe {
            Pipe::Stdout => write!(f, "worker-{}", self.worker),
            Pipe::Stderr => write!(f, "worker-{}:err", self.worker),
        }
    }
}

enum Chunk {
    Data(Vec<u8>),
    Closed,
}

type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

fn read_chunks<R>(mut reader: R, source: LogSource) -> ChunkStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Chunk::Data(buf[..n].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(source = %source, error = %e, "Worker pipe read failed");
                    break;
                }
            }
        }
        yield Chunk::Closed;
    })
}

/// Multiplexes worker pipes into complete, tagged lines.
#[derive(Default)]
pub struct LogWatcher {
    streams: StreamMap<LogSource, ChunkStream>,
    partial: HashMap<LogSource, Vec<u8>>,
}

impl LogWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts watching a pipe, replacing any previous pipe for `source`.
    pub fn watch<R>(&mut self, source: LogSource, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.partial.remove(&source);
        self.streams.insert(source, read_chunks(reader, source));
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Waits up to `timeout` for output, then returns every complete line
    /// available now. Returns an empty batch on timeout.
    pub async fn next_batch(&mut self, timeout: Duration) -> Vec<(LogSource, String)> {
        if self.streams.is_empty() {
            tokio::time::sleep(timeout).await;
            return Vec::new();
        }

        let mut lines = Vec::new();
        let first = match tokio::time::timeout(timeout, self.streams.next()).await {
            Ok(Some(item)) => item,
            Ok(None) | Err(_) => return lines,
        };
        self.absorb(first, &mut lines);

        while let Some(Some(item)) = self.streams.next().now_or_never() {
            self.absorb(item, &mut lines);
        }
        lines
    }

    fn absorb(&mut self, (source, chunk): (LogSource, Chunk), lines: &mut Vec<(LogSource, String)>) {
        match chunk {
            Chunk::Data(bytes) => {
                // Decode whole lines only; a read may end mid-character.
                let pending = self.partial.entry(source).or_default();
                pending.extend_from_slice(&bytes);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    lines.push((source, decode_line(&line)));
                }
            }
            Chunk::Closed => {
                if let Some(rest) = self.partial.remove(&source) {
                    if !rest.is_empty() {
                        lines.push((source, decode_line(&rest)));
                    }
                }
            }
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}
