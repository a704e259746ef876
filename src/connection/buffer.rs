/// Default number of bytes kept by a [RxBuffer]
pub const DEFAULT_RX_CAPACITY: usize = 64 * 1024;

/// Bounded buffer of bytes received from a device
///
/// Once full, the oldest bytes are dropped to make room for new ones.
#[derive(Debug, Clone)]
pub struct RxBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RX_CAPACITY)
    }
}

impl RxBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        RxBuffer {
            data: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append received bytes, dropping the oldest ones beyond capacity
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            self.data.clear();
            self.data
                .extend_from_slice(&bytes[bytes.len() - self.capacity..]);
            return;
        }

        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
        }
        self.data.extend_from_slice(bytes);
    }

    /// The last `max_bytes` bytes
    pub fn snapshot(&self, max_bytes: usize) -> &[u8] {
        let start = self.data.len().saturating_sub(max_bytes);
        &self.data[start..]
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn drops_oldest_bytes_when_full() {
        let mut buffer = RxBuffer::with_capacity(8);

        buffer.push(b"hello ");
        buffer.push(b"world");

        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.snapshot(usize::MAX), b"lo world");

        buffer.push(b"0123456789");
        assert_eq!(buffer.snapshot(usize::MAX), b"23456789");
    }

    #[test]
    fn snapshot_is_bounded_from_the_end() {
        let mut buffer = RxBuffer::default();
        buffer.push(b"abcdef");

        assert_eq!(buffer.snapshot(3), b"def");
        assert_eq!(buffer.snapshot(100), b"abcdef");
        assert_eq!(buffer.snapshot(0), b"");
    }

    #[test]
    fn clear_empties_the_buffer() {
        let mut buffer = RxBuffer::with_capacity(16);
        buffer.push(b"\x00\xffIMPROV");

        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.snapshot(usize::MAX), b"");
        assert_eq!(buffer.capacity(), 16);
    }
}
