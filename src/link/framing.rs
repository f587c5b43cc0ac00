//! Record framing for the text protocol.
//!
//! TCP delivers a byte stream, so one read may hold half a record or several. The
//! framer accumulates decoded text and splits it into whole records: a control packet
//! ends at its `#` terminator, `new_target` and `target` are complete on their own, and
//! a line break always ends a record. Whatever is left at the end of a read is held
//! back until it either completes or can no longer become a valid record. A tail that
//! is already a whole record but might still grow, such as an unterminated telemetry
//! response, settles: the reader releases it once the peer stays quiet.

use crate::protocol::{EXECUTING, NEW_TARGET, NO_SAMPLE_SENTINEL, PACKET_TERMINATOR, TARGET_ACK};

/// Which record grammar a link speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// `#`-terminated packets, bare keywords and `executing` notices.
    Control,
    /// Unterminated four-field responses and the `9 9 9` sentinel.
    Telemetry,
}

/// Splits a character stream into protocol records.
#[derive(Debug)]
pub struct RecordFramer {
    mode: FrameMode,
    buffer: String,
    capacity: usize,
}

impl RecordFramer {
    /// Create a framer holding at most `capacity` bytes of an incomplete record.
    pub fn new(mode: FrameMode, capacity: usize) -> Self {
        Self { mode, buffer: String::with_capacity(capacity.min(4096)), capacity: capacity.max(1) }
    }

    /// Ingest one read's worth of text and return every record it completes, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut records = Vec::new();
        loop {
            self.skip_whitespace();
            if self.buffer.is_empty() {
                break;
            }
            match self.next_record_len() {
                Some(len) => {
                    let record: String = self.buffer.drain(..len).collect();
                    let record = record.trim();
                    if !record.is_empty() {
                        records.push(record.to_string());
                    }
                }
                None => break,
            }
        }

        if self.buffer.len() > self.capacity {
            tracing::warn!(
                buffered = self.buffer.len(),
                capacity = self.capacity,
                "Receive buffer overflow, flushing partial record"
            );
            records.push(self.take_tail());
        } else if !self.buffer.is_empty() && self.tail() == Tail::Complete {
            records.push(self.take_tail());
        }

        records
    }

    /// Whether the held tail is a whole record unless more text follows shortly.
    ///
    /// The reader should wait briefly and then call [`RecordFramer::settle`].
    pub fn is_settling(&self) -> bool {
        !self.buffer.is_empty() && self.tail() == Tail::Settling
    }

    /// Release a settling tail after the peer went quiet.
    pub fn settle(&mut self) -> Option<String> {
        self.is_settling().then(|| self.take_tail())
    }

    /// Text held back waiting for the rest of a record.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Drop any partial record.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn skip_whitespace(&mut self) {
        let leading = self.buffer.len() - self.buffer.trim_start().len();
        if leading > 0 {
            self.buffer.drain(..leading);
        }
    }

    fn take_tail(&mut self) -> String {
        let tail = self.buffer.trim().to_string();
        self.buffer.clear();
        tail
    }

    /// Byte length of the first complete record at the head of the buffer.
    fn next_record_len(&self) -> Option<usize> {
        let line_end = self.buffer.find(['\n', '\r']);

        if self.mode == FrameMode::Control {
            if let Some(len) = self.keyword_len() {
                return Some(len);
            }
            if let Some(terminator) = self.buffer.find(PACKET_TERMINATOR) {
                if line_end.is_none_or(|end| terminator < end) {
                    return Some(terminator + PACKET_TERMINATOR.len_utf8());
                }
            }
        }

        line_end.map(|end| end + 1)
    }

    /// Length of a keyword record at the head of the buffer, if one is there.
    fn keyword_len(&self) -> Option<usize> {
        [NEW_TARGET, TARGET_ACK].into_iter().find_map(|keyword| {
            let rest = self.buffer.strip_prefix(keyword)?;
            match rest.chars().next() {
                None => Some(keyword.len()),
                Some(next) if next.is_whitespace() => Some(keyword.len()),
                Some(_) => None,
            }
        })
    }

    fn tail(&self) -> Tail {
        let ends_in_space = self.buffer.ends_with(char::is_whitespace);
        let tail = self.buffer.trim();
        let tokens: Vec<&str> = tail.split_whitespace().collect();
        let has_garbage = tokens.iter().any(|token| !could_be_number(token));

        match self.mode {
            FrameMode::Control => {
                let growing_keyword = [NEW_TARGET, TARGET_ACK, EXECUTING]
                    .into_iter()
                    .any(|keyword| keyword.len() > tail.len() && keyword.starts_with(tail));
                if growing_keyword {
                    Tail::Partial
                } else if tail.contains(EXECUTING) {
                    if ends_in_space { Tail::Complete } else { Tail::Settling }
                } else if has_garbage {
                    Tail::Complete
                } else {
                    Tail::Partial
                }
            }
            FrameMode::Telemetry => {
                if tail == NO_SAMPLE_SENTINEL || has_garbage {
                    Tail::Complete
                } else if tokens.len() >= 4 {
                    if ends_in_space { Tail::Complete } else { Tail::Settling }
                } else {
                    Tail::Partial
                }
            }
        }
    }
}

/// What an unterminated tail is worth at the end of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Cannot be a record yet.
    Partial,
    /// A record, but its last token may still be growing.
    Settling,
    Complete,
}

/// Whether `token` is, or could grow into, a decimal number.
fn could_be_number(token: &str) -> bool {
    token.chars().all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> RecordFramer {
        RecordFramer::new(FrameMode::Control, 1024)
    }

    #[test]
    fn two_packets_in_one_read() {
        let mut framer = control();
        let records = framer.push("10 5 9.5 10 #0 5 9.8 10 #");
        assert_eq!(records, vec!["10 5 9.5 10 #", "0 5 9.8 10 #"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn packet_split_across_reads() {
        let mut framer = control();
        assert!(framer.push("10 5 9.").is_empty());
        assert_eq!(framer.pending(), "10 5 9.");
        assert_eq!(framer.push("5 10 #"), vec!["10 5 9.5 10 #"]);
    }

    #[test]
    fn keywords_are_whole_records() {
        let mut framer = control();
        assert_eq!(framer.push("new_target"), vec!["new_target"]);
        assert_eq!(framer.push("target\n1 2 3 4 #"), vec!["target", "1 2 3 4 #"]);
        assert_eq!(framer.push("new_target target"), vec!["new_target", "target"]);
    }

    #[test]
    fn partial_keyword_is_held() {
        let mut framer = control();
        assert!(framer.push("new_tar").is_empty());
        assert_eq!(framer.push("get"), vec!["new_target"]);
    }

    #[test]
    fn executing_notice_settles_when_unterminated() {
        let mut framer = control();
        assert!(framer.push("executing step 2").is_empty());
        assert!(framer.is_settling());
        assert_eq!(framer.settle(), Some("executing step 2".to_string()));
        assert_eq!(framer.push("executing\nnew_target\n"), vec!["executing", "new_target"]);
        assert_eq!(framer.settle(), None);
    }

    #[test]
    fn executing_notice_split_across_reads() {
        let mut framer = control();
        assert!(framer.push("execu").is_empty());
        assert!(!framer.is_settling());
        assert_eq!(framer.push("ting step 2\n"), vec!["executing step 2"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn garbage_is_flushed_rather_than_held() {
        let mut framer = control();
        assert_eq!(framer.push("garbage"), vec!["garbage"]);
    }

    #[test]
    fn overflow_flushes_partial_record() {
        let mut framer = RecordFramer::new(FrameMode::Control, 8);
        assert_eq!(framer.push("1 2 3 4 5 6 7"), vec!["1 2 3 4 5 6 7"]);
    }

    #[test]
    fn telemetry_responses() {
        let mut framer = RecordFramer::new(FrameMode::Telemetry, 1024);
        assert_eq!(framer.push("9 9 9"), vec!["9 9 9"]);
        assert_eq!(framer.push("0.95 0.2 10.0 3.5 "), vec!["0.95 0.2 10.0 3.5"]);
        assert!(framer.push("0.95 0.2").is_empty());
        assert_eq!(framer.push(" 10.0 3.5\n9 9 9\n"), vec!["0.95 0.2 10.0 3.5", "9 9 9"]);
    }

    #[test]
    fn telemetry_split_inside_last_field() {
        let mut framer = RecordFramer::new(FrameMode::Telemetry, 1024);
        assert!(framer.push("0.95 0.2 10.0 3").is_empty());
        assert_eq!(framer.push(".5\n"), vec!["0.95 0.2 10.0 3.5"]);

        assert!(framer.push("0.9 0.1 12.0 4.25").is_empty());
        assert!(framer.is_settling());
        assert_eq!(framer.settle(), Some("0.9 0.1 12.0 4.25".to_string()));
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn reset_drops_partial_record() {
        let mut framer = control();
        framer.push("1 2");
        framer.reset();
        assert!(framer.pending().is_empty());
    }
}
