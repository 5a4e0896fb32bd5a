//! Bounded, redacted in-memory tail of a process's output.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Lines kept per process.
pub const LOG_TAIL_LINES: usize = 200;

const SECRET_KEYS: &[&str] = &["password", "passwd", "secret", "private", "mnemonic", "token"];
const MASK: &str = "[redacted]";

/// Mask secrets in one output line.
///
/// Values of `key=value` / `key: value` pairs whose key looks secret are
/// masked, as is any bare 64-hex-digit token (a raw private key).
#[must_use]
pub fn redact(line: &str) -> String {
    let mut out = Vec::new();
    let mut mask_next = false;

    for word in line.split(' ') {
        if mask_next && !word.is_empty() {
            out.push(MASK.to_string());
            mask_next = false;
            continue;
        }

        let lower = word.to_ascii_lowercase();
        let is_secret_key = |key: &str| SECRET_KEYS.iter().any(|s| key.contains(s));

        if let Some((key, _)) = word.split_once('=') {
            if is_secret_key(&key.to_ascii_lowercase()) {
                out.push(format!("{key}={MASK}"));
                continue;
            }
        }
        if let Some(key) = lower.strip_suffix(':') {
            if is_secret_key(key) {
                mask_next = true;
            }
        }
        if is_raw_key(word) {
            out.push(MASK.to_string());
            continue;
        }
        out.push(word.to_string());
    }
    out.join(" ")
}

fn is_raw_key(word: &str) -> bool {
    let hex = word
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .trim_start_matches("0x");
    hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())
}

/// Ring buffer of the last [`LOG_TAIL_LINES`] lines.
#[derive(Debug)]
pub struct LogTail {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for LogTail {
    fn default() -> Self {
        Self::with_capacity(LOG_TAIL_LINES)
    }
}

impl LogTail {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Up to `n` most recent lines, oldest first.
    #[must_use]
    pub fn last(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }
}
