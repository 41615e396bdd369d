use sha2::{Digest, Sha256};

/// SHA-256 over a download's bytes, fed chunk by chunk as they are written.
#[derive(Default, Clone)]
pub struct StreamDigest {
    hasher: Sha256,
}

impl StreamDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// Lowercase hex digest of everything seen so far.
    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}
