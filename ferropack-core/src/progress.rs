//! Progress events emitted by pipelines.
//!
//! Events are monotonic in `bytes_in` and `bytes_out` within one pipeline.
//! The [`ProgressTap`] owns the counters and guarantees monotonicity even if
//! a stage reports deltas out of order.

/// What kind of work a progress event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    /// Bytes pulled from a source.
    Read,
    /// Bytes pushed to a sink.
    Write,
    /// Entry extraction.
    Extract,
    /// Compression.
    Compress,
    /// Decryption.
    Decrypt,
    /// Encryption.
    Encrypt,
    /// Decompression.
    Decompress,
}

impl ProgressKind {
    /// The wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Extract => "extract",
            Self::Compress => "compress",
            Self::Decrypt => "decrypt",
            Self::Encrypt => "encrypt",
            Self::Decompress => "decompress",
        }
    }
}

/// A single progress observation.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// What kind of work this event describes.
    pub kind: ProgressKind,
    /// Entry being processed, when known.
    pub entry_name: Option<String>,
    /// Input bytes consumed so far.
    pub bytes_in: u64,
    /// Output bytes produced so far.
    pub bytes_out: u64,
    /// Total expected input bytes, when known.
    pub total_in: Option<u64>,
    /// Total expected output bytes, when known.
    pub total_out: Option<u64>,
}

/// Callback type consumed by pipelines.
pub type ProgressCallback<'a> = Box<dyn FnMut(&ProgressEvent) + 'a>;

/// Accumulates byte counters for one pipeline and emits monotonic events.
pub struct ProgressTap<'a> {
    kind: ProgressKind,
    entry_name: Option<String>,
    bytes_in: u64,
    bytes_out: u64,
    total_in: Option<u64>,
    total_out: Option<u64>,
    callback: Option<ProgressCallback<'a>>,
}

impl<'a> ProgressTap<'a> {
    /// Create a tap for the given kind. A `None` callback makes every call a
    /// cheap no-op.
    pub fn new(kind: ProgressKind, callback: Option<ProgressCallback<'a>>) -> Self {
        Self {
            kind,
            entry_name: None,
            bytes_in: 0,
            bytes_out: 0,
            total_in: None,
            total_out: None,
            callback,
        }
    }

    /// Name the entry this tap reports for.
    pub fn with_entry_name(mut self, name: impl Into<String>) -> Self {
        self.entry_name = Some(name.into());
        self
    }

    /// Declare expected totals when they are known up front.
    pub fn with_totals(mut self, total_in: Option<u64>, total_out: Option<u64>) -> Self {
        self.total_in = total_in;
        self.total_out = total_out;
        self
    }

    /// Record work and emit one event.
    pub fn advance(&mut self, in_delta: u64, out_delta: u64) {
        self.bytes_in = self.bytes_in.saturating_add(in_delta);
        self.bytes_out = self.bytes_out.saturating_add(out_delta);
        if let Some(callback) = self.callback.as_mut() {
            callback(&ProgressEvent {
                kind: self.kind,
                entry_name: self.entry_name.clone(),
                bytes_in: self.bytes_in,
                bytes_out: self.bytes_out,
                total_in: self.total_in,
                total_out: self.total_out,
            });
        }
    }

    /// Input bytes consumed so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Output bytes produced so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_events_are_monotonic() {
        let seen: RefCell<Vec<(u64, u64)>> = RefCell::new(Vec::new());
        {
            let mut tap = ProgressTap::new(
                ProgressKind::Decompress,
                Some(Box::new(|ev: &ProgressEvent| {
                    seen.borrow_mut().push((ev.bytes_in, ev.bytes_out));
                })),
            );
            tap.advance(10, 0);
            tap.advance(5, 100);
            tap.advance(0, 50);
        }
        let seen = seen.into_inner();
        assert_eq!(seen, vec![(10, 0), (15, 100), (15, 150)]);
        for pair in seen.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
            assert!(pair[1].1 >= pair[0].1);
        }
    }

    #[test]
    fn test_no_callback_is_noop() {
        let mut tap = ProgressTap::new(ProgressKind::Read, None);
        tap.advance(1, 2);
        assert_eq!(tap.bytes_in(), 1);
        assert_eq!(tap.bytes_out(), 2);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ProgressKind::Decompress.as_str(), "decompress");
        assert_eq!(ProgressKind::Extract.as_str(), "extract");
    }
}
