/// Limits applied by the payload codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Maximum array nesting accepted by the generic codec.
    pub max_nesting_depth: usize,
    /// When true, bytes left after a decoded message are an error.
    pub reject_trailing_bytes: bool,
}

impl ProtocolConfig {
    /// Override the maximum nesting depth.
    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    /// Override trailing-byte handling.
    pub fn with_reject_trailing_bytes(mut self, reject: bool) -> Self {
        self.reject_trailing_bytes = reject;
        self
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 64,
            reject_trailing_bytes: true,
        }
    }
}
