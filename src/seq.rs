//! 16-bit frame sequence numbers with serial-number arithmetic (RFC 1982).
//!
//! Audio frame numbers wrap at 2^16, so plain integer comparison would treat
//! the wrap from 65535 to 0 as a huge jump backwards. All ordering decisions
//! in the repair path go through [`SeqNo::is_after`], which compares within
//! a half-range window of 2^15.

use std::fmt::{Display, Formatter};

const SERIAL_WINDOW: u16 = 0x8000;

/// A frame sequence number. Ordering is *serial*, not numeric: `a` is after
/// `b` iff `(a - b) mod 2^16` lies in `(0, 2^15)`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNo(u16);

impl SeqNo {
    pub fn from_raw(value: u16) -> SeqNo {
        SeqNo(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    /// The next frame number, wrapping at 2^16.
    pub fn next(&self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }

    /// The previous frame number, wrapping at 2^16.
    pub fn prev(&self) -> SeqNo {
        SeqNo(self.0.wrapping_sub(1))
    }

    /// Serial comparison: true iff `self` comes after `other`.
    ///
    /// NB: equal numbers are *not* after each other, so
    /// `!a.is_after(b)` means `a == b || a.is_before(b)`.
    pub fn is_after(&self, other: SeqNo) -> bool {
        let distance = self.0.wrapping_sub(other.0);
        distance != 0 && distance < SERIAL_WINDOW
    }

    /// Serial comparison: true iff `self` comes before `other`.
    pub fn is_before(&self, other: SeqNo) -> bool {
        other.is_after(*self)
    }

    /// The number of `next()` steps from `other` to `self`. Only meaningful
    /// when `self` is at or after `other` within the serial window.
    pub fn offset_from(&self, other: SeqNo) -> u16 {
        self.0.wrapping_sub(other.0)
    }
}

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive range of frame numbers, `start <= end` in serial order with
/// a span below 2^15.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SeqRange {
    start: SeqNo,
    end: SeqNo,
}

impl SeqRange {
    pub fn new(start: SeqNo, end: SeqNo) -> SeqRange {
        debug_assert!(
            start == end || end.is_after(start),
            "range end must not precede its start"
        );
        SeqRange { start, end }
    }

    pub fn single(frame: SeqNo) -> SeqRange {
        SeqRange { start: frame, end: frame }
    }

    pub fn start(&self) -> SeqNo {
        self.start
    }

    pub fn end(&self) -> SeqNo {
        self.end
    }

    /// Number of frames covered, including both ends.
    pub fn frame_count(&self) -> u32 {
        self.end.offset_from(self.start) as u32 + 1
    }
}

impl Display for SeqRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.start, self.end)
    }
}
