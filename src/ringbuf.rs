// Licensed under the MIT license.

//! Single-producer single-consumer byte ring buffer used
//! between the transport reader and the parser in pull mode. One slot is
//! sacrificed to distinguish full from empty, so a capacity-`C` buffer
//! holds at most `C - 1` bytes.

pub struct RingBuffer {
    buf: Vec<u8>,
    size: usize,
    r: usize,
    w: usize,
}

impl RingBuffer {
    pub fn new(size: usize) -> Self {
        assert!(size > 1, "ring buffer capacity must be at least 2");
        RingBuffer { buf: vec![0u8; size], size, r: 0, w: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.size - 1
    }

    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.r == self.w
    }

    /// Bytes available to write before the buffer reports full.
    pub fn free(&self) -> usize {
        if self.w >= self.r {
            self.size - (self.w - self.r) - 1
        } else {
            self.r - self.w - 1
        }
    }

    /// Bytes available to read.
    pub fn len(&self) -> usize {
        if self.w >= self.r {
            self.w - self.r
        } else {
            self.size - self.r + self.w
        }
    }

    /// Writes as much of `data` as fits, returning the number of bytes
    /// actually written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let free = self.free();
        let count = data.len().min(free);
        if count == 0 {
            return 0;
        }
        let tail = (self.size - self.w).min(count);
        self.buf[self.w..self.w + tail].copy_from_slice(&data[..tail]);
        let mut w = self.w + tail;
        let remaining = count - tail;
        if remaining > 0 {
            self.buf[..remaining].copy_from_slice(&data[tail..tail + remaining]);
            w = remaining;
        }
        self.w = if w >= self.size { 0 } else { w };
        count
    }

    /// Reads up to `dst.len()` bytes, advancing the read pointer.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.skip(n);
        n
    }

    /// Copies up to `dst.len()` bytes without advancing the read pointer.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let avail = self.len();
        let count = dst.len().min(avail);
        if count == 0 {
            return 0;
        }
        let tail = (self.size - self.r).min(count);
        dst[..tail].copy_from_slice(&self.buf[self.r..self.r + tail]);
        let remaining = count - tail;
        if remaining > 0 {
            dst[tail..tail + remaining].copy_from_slice(&self.buf[..remaining]);
        }
        count
    }

    /// Advances the read pointer by `count` bytes without copying.
    pub fn skip(&mut self, count: usize) {
        let count = count.min(self.len());
        let mut r = self.r + count;
        if r >= self.size {
            r -= self.size;
        }
        self.r = r;
    }

    /// Address and length of the next contiguous (non-wrapping) readable
    /// block, so a pull-mode consumer can process data in place.
    pub fn linear_read_block(&self) -> &[u8] {
        if self.w >= self.r {
            &self.buf[self.r..self.w]
        } else {
            &self.buf[self.r..self.size]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_size_minus_one() {
        let rb = RingBuffer::new(8);
        assert_eq!(rb.capacity(), 7);
    }

    #[test]
    fn fills_at_capacity_minus_one() {
        let mut rb = RingBuffer::new(4);
        let written = rb.write(&[1, 2, 3, 4, 5]);
        assert_eq!(written, 3);
        assert!(rb.is_full());
    }

    #[test]
    fn write_read_roundtrip_across_wrap() {
        let mut rb = RingBuffer::new(4);
        assert_eq!(rb.write(&[1, 2, 3]), 3);
        let mut out = [0u8; 2];
        assert_eq!(rb.read(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(rb.write(&[4, 5]), 2);
        let mut out2 = [0u8; 3];
        assert_eq!(rb.read(&mut out2), 3);
        assert_eq!(out2, [3, 4, 5]);
    }

    #[test]
    fn concatenated_reads_equal_concatenated_writes_when_not_overflowing() {
        let mut rb = RingBuffer::new(16);
        let mut produced = Vec::new();
        let mut consumed = Vec::new();
        for i in 0..40u8 {
            let chunk = [i, i.wrapping_add(1), i.wrapping_add(2)];
            let n = rb.write(&chunk);
            produced.extend_from_slice(&chunk[..n]);
            let mut buf = [0u8; 2];
            let r = rb.read(&mut buf);
            consumed.extend_from_slice(&buf[..r]);
        }
        let mut rest = vec![0u8; rb.len()];
        let r = rb.read(&mut rest);
        consumed.extend_from_slice(&rest[..r]);
        assert_eq!(produced, consumed);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut rb = RingBuffer::new(8);
        rb.write(&[1, 2, 3]);
        let mut out = [0u8; 3];
        rb.peek(&mut out);
        assert_eq!(rb.len(), 3);
        rb.skip(3);
        assert!(rb.is_empty());
    }
}
