use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use crossbeam_channel::{Receiver, Sender};
use flate2::{write::GzEncoder, Compression};
use tracing::{debug, error};

use crate::types::GroupOutput;

/// Holds results that arrive out of order until every earlier index has been seen
#[derive(Debug)]
pub(crate) struct Collator<T> {
    pub waiting: BTreeMap<usize, T>,
    pub next_key: usize,
}

impl<T> Default for Collator<T> {
    fn default() -> Self {
        Self {
            waiting: BTreeMap::new(),
            next_key: 0,
        }
    }
}

impl<T> Collator<T> {
    pub fn receive(&mut self, key: usize, item: T) {
        self.waiting.insert(key, item);
    }

    pub fn has_next(&self) -> bool {
        self.waiting.contains_key(&self.next_key)
    }

    pub fn try_next(&mut self) -> Option<(usize, T)> {
        let item = self.waiting.remove(&self.next_key)?;
        let key = self.next_key;
        self.next_key += 1;
        Some((key, item))
    }
}

pub(crate) fn collate_results<T: Send>(
    receiver: Receiver<(usize, T)>,
    sender: Sender<(usize, T)>,
) {
    let mut collator = Collator::default();
    while let Ok((group_idx, group)) = receiver.recv() {
        collator.receive(group_idx, group);
        if !collator.has_next() {
            tracing::trace!(
                "Collator holding {} groups, waiting for {}",
                collator.waiting.len(),
                collator.next_key
            );
            continue;
        }
        while let Some((group_idx, group)) = collator.try_next() {
            if let Err(e) = sender.send((group_idx, group)) {
                error!("Failed to send {group_idx} for writing: {e}");
                return;
            }
        }
    }
    let n = collator.waiting.len();
    if n > 0 {
        debug!("Draining output queue, {n} items");
        for (group_idx, group) in std::mem::take(&mut collator.waiting) {
            if let Err(e) = sender.send((group_idx, group)) {
                error!("Failed to send {group_idx} for writing: {e}");
                return;
            }
        }
    }
}

/// Where output lines go. Must be [`finish`](OutputSink::finish)ed to complete a
/// compressed stream.
pub(crate) enum OutputSink {
    Stdout(io::Stdout),
    Plain(io::BufWriter<fs::File>),
    Gzip(GzEncoder<io::BufWriter<fs::File>>),
}

impl OutputSink {
    /// `-` is STDOUT, a path ending in `.gz` is gzip compressed
    pub fn create(path: &Path) -> io::Result<Self> {
        if path == Path::new("-") {
            return Ok(Self::Stdout(io::stdout()));
        }
        let handle = io::BufWriter::new(fs::File::create(path)?);
        let compressed = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
        if compressed {
            Ok(Self::Gzip(GzEncoder::new(handle, Compression::best())))
        } else {
            Ok(Self::Plain(handle))
        }
    }

    pub fn finish(self) -> io::Result<()> {
        match self {
            Self::Stdout(mut handle) => handle.flush(),
            Self::Plain(mut handle) => handle.flush(),
            Self::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout(handle) => handle.write(buf),
            Self::Plain(handle) => handle.write(buf),
            Self::Gzip(handle) => handle.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(handle) => handle.flush(),
            Self::Plain(handle) => handle.flush(),
            Self::Gzip(handle) => handle.flush(),
        }
    }
}

/// Write each group as one line of JSON, returning the writer and the number of lines
/// written
pub(crate) fn write_output<W: Write>(
    writer: W,
    receiver: Receiver<(usize, GroupOutput)>,
) -> io::Result<(W, usize)> {
    let mut writer = io::BufWriter::new(writer);
    let mut count = 0;
    while let Ok((group_idx, group)) = receiver.recv() {
        debug!("Writing group {group_idx} ({})", group.name);
        serde_json::to_writer(&mut writer, &group)?;
        writer.write_all(b"\n")?;
        count += 1;
    }
    let writer = writer.into_inner().map_err(|e| e.into_error())?;
    Ok((writer, count))
}
