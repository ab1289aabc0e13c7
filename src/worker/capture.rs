use std::io::{ErrorKind, Read};

const READ_CHUNK_BYTES: usize = 8 * 1024;
const MAX_FORWARDED_LINE_BYTES: usize = 4 * 1024;

/// Everything kept from one worker stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub total_bytes: u64,
}

impl CapturedStream {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Append-only buffer that stops growing at `cap` and remembers it did.
#[derive(Debug)]
pub struct BoundedBuffer {
    cap: usize,
    captured: CapturedStream,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            captured: CapturedStream::default(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.captured.total_bytes += chunk.len() as u64;
        let room = self.cap.saturating_sub(self.captured.bytes.len());
        if chunk.len() > room {
            self.captured.truncated = true;
        }
        let keep = chunk.len().min(room);
        self.captured.bytes.extend_from_slice(&chunk[..keep]);
    }

    pub fn finish(self) -> CapturedStream {
        self.captured
    }
}

/// Splits a byte stream into lines for forwarding. Lines longer than
/// `MAX_FORWARDED_LINE_BYTES` are emitted in pieces so a worker that never
/// writes a newline cannot grow the pending buffer.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn feed<F: FnMut(&str)>(&mut self, chunk: &[u8], on_line: &mut F) {
        for byte in chunk {
            if *byte == b'\n' {
                self.flush(on_line);
                continue;
            }
            self.pending.push(*byte);
            if self.pending.len() >= MAX_FORWARDED_LINE_BYTES {
                self.flush(on_line);
            }
        }
    }

    fn flush<F: FnMut(&str)>(&mut self, on_line: &mut F) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending);
        let line = line.trim_end_matches('\r');
        if !line.trim().is_empty() {
            on_line(line);
        }
        self.pending.clear();
    }
}

/// Reads `reader` to EOF. At most `cap` bytes are kept; the rest is read
/// and discarded so the writer never blocks on a full pipe. Every complete
/// line is also handed to `on_line` as it arrives.
pub fn capture_stream<R, F>(mut reader: R, cap: usize, mut on_line: F) -> CapturedStream
where
    R: Read,
    F: FnMut(&str),
{
    let mut buffer = BoundedBuffer::new(cap);
    let mut lines = LineSplitter::default();
    let mut chunk = [0_u8; READ_CHUNK_BYTES];

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                buffer.push(&chunk[..read]);
                lines.feed(&chunk[..read], &mut on_line);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    lines.flush(&mut on_line);
    buffer.finish()
}
