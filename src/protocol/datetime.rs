//! Seven-byte device timestamp.

use std::fmt;

use chrono::{Datelike, Local, NaiveDateTime, Timelike};

/// Packed wall-clock time: `[yy, mm, dd, weekday, hh, mi, ss]`.
///
/// Year is stored modulo 100 and weekday follows ISO numbering (Mon=1..Sun=7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateTime7([u8; 7]);

impl DateTime7 {
    pub fn new(bytes: [u8; 7]) -> Self {
        Self(bytes)
    }

    /// All-zero timestamp, used when a command is deliberately not time-stamped.
    pub fn zero() -> Self {
        Self([0; 7])
    }

    /// Current server time in the local timezone.
    pub fn now() -> Self {
        Self::from_naive(&Local::now().naive_local())
    }

    pub fn from_naive(t: &NaiveDateTime) -> Self {
        Self([
            (t.year().rem_euclid(100)) as u8,
            t.month() as u8,
            t.day() as u8,
            t.weekday().number_from_monday() as u8,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
        ])
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 7] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 7]
    }
}

impl fmt::Display for DateTime7 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [yy, mm, dd, w, hh, mi, ss] = self.0;
        write!(f, "{yy:02}-{mm:02}-{dd:02}({w}) {hh:02}:{mi:02}:{ss:02}")
    }
}
