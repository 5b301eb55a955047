//! NEX primitive types that appear in the transport layer itself: PIDs in Kerberos tickets,
//!  timestamps for ticket freshness and the class version table of verbose RMC messages.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use crate::util::byte_stream::{ByteStreamIn, ByteStreamOut};
use crate::util::safe_converter::PrecheckedCast;

/// A user's principal ID. Stored as 64 bits; it is written as 4 or 8 bytes depending on the
///  stream's `pid_size` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pid(pub u64);

impl Pid {
    pub fn read(stream: &mut ByteStreamIn) -> anyhow::Result<Pid> {
        Ok(Pid(stream.read_pid_raw()?))
    }

    pub fn write(&self, stream: &mut ByteStreamOut) {
        stream.write_pid_raw(self.0);
    }
}

impl Display for Pid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// NEX packed timestamp:
///
/// ```ascii
/// bits 0-5:   second
/// bits 6-11:  minute
/// bits 12-16: hour
/// bits 17-21: day
/// bits 22-25: month
/// bits 26-:   year
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DateTime(pub u64);

impl DateTime {
    pub fn new(year: u64, month: u64, day: u64, hour: u64, minute: u64, second: u64) -> DateTime {
        DateTime(second | (minute << 6) | (hour << 12) | (day << 17) | (month << 22) | (year << 26))
    }

    pub fn from_utc(timestamp: chrono::DateTime<Utc>) -> DateTime {
        DateTime::new(
            timestamp.year() as u64,
            timestamp.month() as u64,
            timestamp.day() as u64,
            timestamp.hour() as u64,
            timestamp.minute() as u64,
            timestamp.second() as u64,
        )
    }

    pub fn now() -> DateTime {
        Self::from_utc(Utc::now())
    }

    pub fn second(&self) -> u32 { (self.0 & 63) as u32 }
    pub fn minute(&self) -> u32 { ((self.0 >> 6) & 63) as u32 }
    pub fn hour(&self) -> u32 { ((self.0 >> 12) & 31) as u32 }
    pub fn day(&self) -> u32 { ((self.0 >> 17) & 31) as u32 }
    pub fn month(&self) -> u32 { ((self.0 >> 22) & 15) as u32 }
    pub fn year(&self) -> i32 { (self.0 >> 26) as i32 }

    /// `None` if the packed fields do not form a valid calendar date
    pub fn to_utc(&self) -> Option<chrono::DateTime<Utc>> {
        Utc.with_ymd_and_hms(self.year(), self.month(), self.day(), self.hour(), self.minute(), self.second())
            .single()
    }

    pub fn read(stream: &mut ByteStreamIn) -> anyhow::Result<DateTime> {
        Ok(DateTime(stream.read_u64_le()?))
    }

    pub fn write(&self, stream: &mut ByteStreamOut) {
        stream.write_u64_le(self.0);
    }
}


/// Protocol class name to version, sent in the header of verbose RMC requests
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassVersionContainer {
    pub class_versions: BTreeMap<String, u16>,
}

impl ClassVersionContainer {
    pub fn read(stream: &mut ByteStreamIn) -> anyhow::Result<ClassVersionContainer> {
        let len = stream.read_u32_le()?;
        let mut class_versions = BTreeMap::new();
        for _ in 0..len {
            let name = stream.read_string()?;
            let version = stream.read_u16_le()?;
            class_versions.insert(name, version);
        }
        Ok(ClassVersionContainer { class_versions })
    }

    pub fn write(&self, stream: &mut ByteStreamOut) {
        stream.write_u32_le(self.class_versions.len().prechecked_cast());
        for (name, version) in &self.class_versions {
            stream.write_string(name);
            stream.write_u16_le(*version);
        }
    }
}
