//! Circular byte store with a monotonically increasing write position.
//!
//! The external cursor is the total number of bytes ever appended, not a
//! modular index; `offset % capacity` stays an internal concern. A reader
//! holding offset `c` has been lapped once `write_pos - c > capacity`, at
//! which point its data is gone and it must fast-forward.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("data overwritten: requested offset {requested}, oldest available {oldest}")]
    Overwritten { requested: u64, oldest: u64 },
}

pub struct RingBuffer {
    buf: Vec<u8>,
    /// Total bytes written since construction. Never decreases.
    write_pos: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            buf: vec![0; capacity],
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn write_pos(&self) -> u64 {
        self.write_pos
    }

    /// Offset of the oldest byte still retained.
    fn oldest_offset(&self) -> u64 {
        self.write_pos.saturating_sub(self.buf.len() as u64)
    }

    /// Copy `data` in, wrapping within the fixed capacity. Never fails; data
    /// longer than the capacity simply leaves only its last `capacity` bytes
    /// retained.
    pub fn append(&mut self, mut data: &[u8]) {
        let cap = self.buf.len();
        while !data.is_empty() {
            let idx = (self.write_pos % cap as u64) as usize;
            let n = data.len().min(cap - idx);
            self.buf[idx..idx + n].copy_from_slice(&data[..n]);
            self.write_pos += n as u64;
            data = &data[n..];
        }
    }

    /// Copy `len` retained bytes starting at absolute offset `start`.
    /// Caller guarantees the range lies inside the retained window.
    fn copy_out(&self, start: u64, len: usize) -> Vec<u8> {
        let cap = self.buf.len();
        let mut out = Vec::with_capacity(len);
        let mut pos = start;
        while out.len() < len {
            let idx = (pos % cap as u64) as usize;
            let end = cap.min(idx + (len - out.len()));
            out.extend_from_slice(&self.buf[idx..end]);
            pos += (end - idx) as u64;
        }
        out
    }

    /// The entire retained window in write order, plus its start offset.
    pub fn snapshot(&self) -> (Vec<u8>, u64) {
        let oldest = self.oldest_offset();
        let available = (self.write_pos - oldest) as usize;
        if available == 0 {
            return (Vec::new(), self.write_pos);
        }
        (self.copy_out(oldest, available), oldest)
    }

    /// The last `min(n, retained)` bytes plus the offset they begin at.
    pub fn tail(&self, n: usize) -> (Vec<u8>, u64) {
        let oldest = self.oldest_offset();
        let available = (self.write_pos - oldest) as usize;
        let n = n.min(available);
        if n == 0 {
            return (Vec::new(), self.write_pos);
        }
        let start = self.write_pos - n as u64;
        (self.copy_out(start, n), start)
    }

    /// Like `tail`, but truncated to begin at the most recent terminal
    /// redraw point (clear-screen or alternate-screen enter) within the last
    /// `max_search` bytes, so a terminal emulator gets a clean starting
    /// state. Falls back to the raw tail when no marker is found.
    pub fn tail_from_redraw(&self, max_search: usize) -> (Vec<u8>, u64) {
        let (tail, start) = self.tail(max_search);
        if tail.is_empty() {
            return (tail, start);
        }

        const MARKERS: [&[u8]; 2] = [
            b"\x1b[2J",     // clear entire screen
            b"\x1b[?1049h", // enter alternate screen buffer
        ];

        let best = MARKERS
            .iter()
            .filter_map(|m| tail.windows(m.len()).rposition(|w| w == *m))
            .max();

        match best {
            Some(pos) => (tail[pos..].to_vec(), start + pos as u64),
            None => (tail, start),
        }
    }

    /// Read bytes newer than `offset` into `dst`, returning the count read
    /// and the next offset to resume from. An offset older than the retained
    /// window fails with the fast-forward offset the caller should use.
    pub fn read_from(&self, offset: u64, dst: &mut [u8]) -> Result<(usize, u64), RingError> {
        let oldest = self.oldest_offset();
        if offset < oldest {
            return Err(RingError::Overwritten {
                requested: offset,
                oldest,
            });
        }
        if offset >= self.write_pos {
            return Ok((0, offset));
        }

        let available = ((self.write_pos - offset) as usize).min(dst.len());
        let data = self.copy_out(offset, available);
        dst[..available].copy_from_slice(&data);
        Ok((available, offset + available as u64))
    }
}
