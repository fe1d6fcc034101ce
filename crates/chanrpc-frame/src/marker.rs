use crate::buffers::Buffers;

/// Byte-wise automaton matching a fixed 4-byte marker.
///
/// `matched` counts marker bytes seen so far. A mismatch resets the count to
/// zero; the mismatching byte is then tried as the first marker byte again.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MarkerMatcher {
    marker: [u8; 4],
    matched: usize,
}

impl MarkerMatcher {
    pub(crate) const fn new(marker: [u8; 4]) -> Self {
        Self { marker, matched: 0 }
    }

    /// Feed one byte. Returns true when the final marker byte was consumed.
    pub(crate) fn feed(&mut self, byte: u8) -> bool {
        if byte == self.marker[self.matched] {
            self.matched += 1;
            if self.matched == self.marker.len() {
                self.matched = 0;
                return true;
            }
        } else {
            self.matched = usize::from(byte == self.marker[0]);
        }
        false
    }

    pub(crate) fn matched(&self) -> usize {
        self.matched
    }

    pub(crate) fn reset(&mut self) {
        self.matched = 0;
    }

    /// Scan `buffers` from the front and drop every byte consumed by the
    /// automaton. Returns true once a full marker has been consumed; the
    /// buffer then starts right after it.
    pub(crate) fn seek(&mut self, buffers: &mut Buffers) -> bool {
        let mut consumed = 0;
        let mut found = false;
        if let Ok(cursor) = buffers.cursor(0) {
            for byte in cursor {
                consumed += 1;
                if self.feed(byte) {
                    found = true;
                    break;
                }
            }
        }
        // Bytes already folded into `matched` are dropped too; the count alone
        // carries the partial match into the next push.
        let _ = buffers.advance(consumed);
        found
    }
}
