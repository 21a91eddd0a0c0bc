//! Line-oriented diagnostic output on top of a per-line sink such as RTT.

use core::fmt;

/// Collects text into lines of at most `N` bytes and hands each to `emit`.
///
/// Lines longer than `N` are split. A trailing partial line is emitted by
/// [`flush`](LineWriter::flush) or on drop.
pub struct LineWriter<F: FnMut(&str), const N: usize = 128> {
    buf: [u8; N],
    len: usize,
    emit: F,
}

impl<F: FnMut(&str), const N: usize> LineWriter<F, N> {
    pub fn new(emit: F) -> Self {
        Self {
            buf: [0; N],
            len: 0,
            emit,
        }
    }

    pub fn flush(&mut self) {
        if self.len > 0 {
            self.emit_line();
        }
    }

    fn emit_line(&mut self) {
        // Only whole chars are ever pushed, so the buffer is valid UTF-8.
        let line = core::str::from_utf8(&self.buf[..self.len]).unwrap_or("");
        (self.emit)(line);
        self.len = 0;
    }

    fn push(&mut self, c: char) {
        if c == '\n' {
            self.emit_line();
            return;
        }
        if c == '\r' {
            return;
        }
        let mut utf8 = [0u8; 4];
        let encoded = c.encode_utf8(&mut utf8).as_bytes();
        if self.len + encoded.len() > N {
            self.emit_line();
        }
        self.buf[self.len..self.len + encoded.len()].copy_from_slice(encoded);
        self.len += encoded.len();
    }
}

impl<F: FnMut(&str), const N: usize> fmt::Write for LineWriter<F, N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.chars().for_each(|c| self.push(c));
        Ok(())
    }
}

impl<F: FnMut(&str), const N: usize> Drop for LineWriter<F, N> {
    fn drop(&mut self) {
        self.flush();
    }
}
