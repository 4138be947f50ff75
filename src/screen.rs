use std::sync::Mutex;

/// Default rolling buffer capacity per session.
pub const DEFAULT_SCREEN_BUF_SIZE: usize = 64 * 1024;

/// A rolling buffer of the most recent raw SOL bytes for one session.
///
/// New subscribers replay this into their terminal emulator so the screen
/// arrives at the correct state before live bytes start flowing.
pub struct ScreenBuffer {
    inner: Mutex<Vec<u8>>,
    max: usize,
}

impl ScreenBuffer {
    /// Create a buffer bounded at `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::with_capacity(max_size)),
            max: max_size,
        }
    }

    /// Append raw bytes, discarding the oldest bytes beyond the cap.
    pub fn write(&self, p: &[u8]) {
        let mut data = self.inner.lock().expect("screen buffer lock");
        data.extend_from_slice(p);
        if data.len() > self.max {
            let excess = data.len() - self.max;
            data.drain(..excess);
        }
    }

    /// A copy of the buffered bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.lock().expect("screen buffer lock").clone()
    }

    /// Drop all buffered bytes.
    pub fn reset(&self) {
        self.inner.lock().expect("screen buffer lock").clear();
    }
}

impl Default for ScreenBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_SCREEN_BUF_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_tail_beyond_cap() {
        let sb = ScreenBuffer::new(8);
        sb.write(b"0123456789abcdef");
        assert_eq!(sb.bytes(), b"89abcdef");

        sb.write(b"XY");
        assert_eq!(sb.bytes(), b"abcdefXY");
    }

    #[test]
    fn exact_tail_of_concatenated_input() {
        let sb = ScreenBuffer::new(16);
        let mut all = Vec::new();
        for chunk in [&b"hello "[..], b"cruel ", b"world ", b"again"] {
            sb.write(chunk);
            all.extend_from_slice(chunk);
        }
        let expected = &all[all.len() - 16..];
        assert_eq!(sb.bytes(), expected);
    }

    #[test]
    fn reset_empties() {
        let sb = ScreenBuffer::new(8);
        sb.write(b"data");
        sb.reset();
        assert!(sb.bytes().is_empty());
    }
}
