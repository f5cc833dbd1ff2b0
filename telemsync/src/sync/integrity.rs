use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub actual: String,
    pub matched: bool,
}

pub fn verify(bytes: &[u8], expected: &str) -> Verification {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.verify(expected)
}

pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}

#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.inner.finalize())
    }

    pub fn verify(self, expected: &str) -> Verification {
        let actual = self.finish();
        let matched = digests_match(&actual, expected);
        Verification { actual, matched }
    }
}
