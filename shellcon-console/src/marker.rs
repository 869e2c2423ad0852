//! Sentinel markers that frame a command's output inside the shell stream.
//!
//! Every invocation gets four fresh random tokens. The start frame is
//! `/#<s1>#//#<s2>#/` and the end frame is `/#<e1>#/<exit-code>/#<e2>#/`.
//! Stderr is framed by `/#<s1>#/` and `/#<e2>#/`, so output the shell wrote
//! to stderr before the end frame is known to be complete.
//! The probe templates receive the tokens as `printf` arguments, so the
//! literal frames never appear in the command text itself.

/// Exit code reported for cancelled invocations (128 + SIGTERM).
pub const CANCELLED_EXIT_CODE: i32 = 143;

/// Longest exit code text accepted inside an end frame (`-2147483648`).
const MAX_EXIT_CODE_LEN: usize = 11;

/// The four tokens of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    start: (u64, u64),
    end: (u64, u64),
}

impl Markers {
    pub fn generate() -> Self {
        Self {
            start: (rand::random(), rand::random()),
            end: (rand::random(), rand::random()),
        }
    }

    #[cfg(test)]
    pub(crate) fn fixed(start: (u64, u64), end: (u64, u64)) -> Self {
        Self { start, end }
    }

    /// Text the start probe prints.
    pub fn start_frame(&self) -> String {
        format!("/#{}#//#{}#/", self.start.0, self.start.1)
    }

    /// Opening delimiter of the end frame.
    pub fn end_open(&self) -> String {
        format!("/#{}#/", self.end.0)
    }

    /// Closing delimiter of the end frame.
    pub fn end_close(&self) -> String {
        format!("/#{}#/", self.end.1)
    }

    /// Text the start probe prints on stderr.
    pub fn stderr_start_frame(&self) -> String {
        format!("/#{}#/", self.start.0)
    }

    /// Text the exit probe prints on stderr after the end frame.
    pub fn stderr_end_frame(&self) -> String {
        format!("/#{}#/", self.end.1)
    }

    /// Format the shell's start probe template with the start tokens.
    pub fn start_probe(&self, template: &str) -> String {
        fill(template, self.start)
    }

    /// Format the shell's exit probe template with the end tokens.
    pub fn exit_probe(&self, template: &str) -> String {
        fill(template, self.end)
    }

    pub(crate) fn start_scanner(&self) -> NeedleScanner {
        NeedleScanner::new(self.start_frame().into_bytes())
    }

    pub(crate) fn end_scanner(&self) -> EndFrameScanner {
        EndFrameScanner::new(self.end_open().into_bytes(), self.end_close().into_bytes())
    }

    pub(crate) fn stderr_start_scanner(&self) -> NeedleScanner {
        NeedleScanner::new(self.stderr_start_frame().into_bytes())
    }

    pub(crate) fn stderr_end_scanner(&self) -> NeedleScanner {
        NeedleScanner::new(self.stderr_end_frame().into_bytes())
    }
}

fn fill(template: &str, (a, b): (u64, u64)) -> String {
    template
        .replace("{0}", &a.to_string())
        .replace("{1}", &b.to_string())
}

/// Incremental search for a fixed byte sequence in a growing buffer.
///
/// Only bytes appended since the last call (plus `needle.len() - 1` bytes of
/// overlap) are examined on each call.
#[derive(Debug)]
pub(crate) struct NeedleScanner {
    needle: Vec<u8>,
    /// No match starts before this offset.
    scanned: usize,
}

impl NeedleScanner {
    pub(crate) fn new(needle: Vec<u8>) -> Self {
        debug_assert!(!needle.is_empty());
        Self { needle, scanned: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.needle.len()
    }

    /// Offset of the first match at or after the scan position.
    pub(crate) fn find(&mut self, haystack: &[u8]) -> Option<usize> {
        if self.scanned < haystack.len() {
            if let Some(pos) = haystack[self.scanned..]
                .windows(self.needle.len())
                .position(|w| w == self.needle.as_slice())
            {
                return Some(self.scanned + pos);
            }
        }
        self.scanned = self
            .scanned
            .max(haystack.len().saturating_sub(self.needle.len() - 1));
        None
    }

    /// Resume scanning after a rejected candidate at `pos`.
    pub(crate) fn skip_past(&mut self, pos: usize) {
        self.scanned = pos + 1;
    }

    /// The first `n` bytes of the haystack were removed.
    pub(crate) fn shift(&mut self, n: usize) {
        self.scanned = self.scanned.saturating_sub(n);
    }
}

/// Outcome of scanning for the end frame.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EndScan {
    /// No frame can start before `safe_len`; bytes up to there are data.
    NotFound { safe_len: usize },
    /// A frame may start at `at` but is not complete yet.
    Partial { at: usize },
    /// Complete frame at `at` spanning `len` bytes.
    Found { at: usize, len: usize, exit_code: i32 },
}

#[derive(Debug)]
pub(crate) struct EndFrameScanner {
    open: NeedleScanner,
    close: Vec<u8>,
}

impl EndFrameScanner {
    fn new(open: Vec<u8>, close: Vec<u8>) -> Self {
        Self {
            open: NeedleScanner::new(open),
            close,
        }
    }

    pub(crate) fn scan(&mut self, buf: &[u8]) -> EndScan {
        loop {
            let Some(at) = self.open.find(buf) else {
                // A frame may still begin inside the last `open.len() - 1` bytes.
                return EndScan::NotFound {
                    safe_len: buf.len().saturating_sub(self.open.len() - 1),
                };
            };

            let rest = &buf[at + self.open.len()..];
            let mut digits = 0;
            if rest.first() == Some(&b'-') {
                digits = 1;
            }
            while digits < rest.len() && rest[digits].is_ascii_digit() {
                digits += 1;
            }
            if digits > MAX_EXIT_CODE_LEN {
                self.open.skip_past(at);
                continue;
            }
            if digits == rest.len() {
                return EndScan::Partial { at };
            }

            let tail = &rest[digits..];
            if tail.len() < self.close.len() {
                if self.close.starts_with(tail) {
                    return EndScan::Partial { at };
                }
                self.open.skip_past(at);
                continue;
            }
            if !tail.starts_with(&self.close) {
                self.open.skip_past(at);
                continue;
            }

            let parsed = std::str::from_utf8(&rest[..digits])
                .ok()
                .and_then(|s| s.parse::<i32>().ok());
            match parsed {
                Some(exit_code) => {
                    return EndScan::Found {
                        at,
                        len: self.open.len() + digits + self.close.len(),
                        exit_code,
                    };
                }
                None => {
                    self.open.skip_past(at);
                    continue;
                }
            }
        }
    }

    pub(crate) fn shift(&mut self, n: usize) {
        self.open.shift(n);
    }
}
