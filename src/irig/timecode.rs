//! IRIG-B time-of-year fields.
//!
//! The decoder stores bit position `10 * d + n` of a frame as bit `n` of data word `d`.
//! Positions 0 and `10 * d + 9` are markers and never carry data, so the BCD fields land
//! in the words like this:
//!
//! ```text
//! word 0  bits 1-4 seconds units   bits 6-8 seconds tens
//! word 1  bits 0-3 minutes units   bits 5-7 minutes tens
//! word 2  bits 0-3 hours units     bits 5-6 hours tens
//! word 3  bits 0-3 day units       bits 5-8 day tens
//! word 4  bits 0-1 day hundreds
//! ```

use crate::data::layout::IRIG_DECADES;
use crate::error::{AppResult, DaqError};
use crate::irig::classify::Symbol;
use chrono::{NaiveTime, Timelike};
use std::fmt;

/// Seconds in a day.
pub const SECONDS_PER_DAY: u32 = 86_400;

const DAYS_PER_YEAR: u32 = 365;

#[derive(Clone, Copy)]
struct BcdField {
    word: usize,
    units_shift: u32,
    tens_shift: u32,
    tens_bits: u32,
}

const SECONDS: BcdField = BcdField {
    word: 0,
    units_shift: 1,
    tens_shift: 6,
    tens_bits: 3,
};
const MINUTES: BcdField = BcdField {
    word: 1,
    units_shift: 0,
    tens_shift: 5,
    tens_bits: 3,
};
const HOURS: BcdField = BcdField {
    word: 2,
    units_shift: 0,
    tens_shift: 5,
    tens_bits: 2,
};
const DAYS: BcdField = BcdField {
    word: 3,
    units_shift: 0,
    tens_shift: 5,
    tens_bits: 4,
};
const DAY_HUNDREDS_WORD: usize = 4;

impl BcdField {
    fn read(self, info: &[u32; IRIG_DECADES]) -> Result<u32, String> {
        let word = info[self.word];
        let units = (word >> self.units_shift) & 0xF;
        let tens = (word >> self.tens_shift) & ((1 << self.tens_bits) - 1);
        if units > 9 || tens > 9 {
            return Err(format!("non-BCD digit in word {}: {word:#05x}", self.word));
        }
        Ok(tens * 10 + units)
    }

    fn write(self, info: &mut [u32; IRIG_DECADES], value: u32) {
        info[self.word] |= (value % 10) << self.units_shift;
        info[self.word] |= ((value / 10) % 10) << self.tens_shift;
    }
}

/// Time of year carried by one frame (leap years are not modelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timecode {
    /// Day of year, 1..=366.
    pub day_of_year: u16,
    /// Hours, 0..=23.
    pub hours: u8,
    /// Minutes, 0..=59.
    pub minutes: u8,
    /// Seconds, 0..=59.
    pub seconds: u8,
}

impl Timecode {
    /// Build a checked timecode.
    pub fn new(day_of_year: u16, hours: u8, minutes: u8, seconds: u8) -> AppResult<Self> {
        if !(1..=366).contains(&day_of_year) || hours > 23 || minutes > 59 || seconds > 59 {
            return Err(DaqError::Timecode(format!(
                "{day_of_year:03} {hours:02}:{minutes:02}:{seconds:02} is out of range"
            )));
        }
        Ok(Self {
            day_of_year,
            hours,
            minutes,
            seconds,
        })
    }

    /// Build a timecode from a wall-clock time.
    pub fn from_time(day_of_year: u16, time: NaiveTime) -> AppResult<Self> {
        Self::new(
            day_of_year,
            time.hour() as u8,
            time.minute() as u8,
            time.second() as u8,
        )
    }

    /// Parse `HH:MM:SS`.
    pub fn parse(day_of_year: u16, text: &str) -> AppResult<Self> {
        let time = NaiveTime::parse_from_str(text, "%H:%M:%S")
            .map_err(|e| DaqError::Timecode(format!("cannot parse {text:?}: {e}")))?;
        Self::from_time(day_of_year, time)
    }

    /// Read the time fields out of a frame's data words.
    pub fn decode(info: &[u32; IRIG_DECADES]) -> AppResult<Self> {
        let seconds = SECONDS.read(info).map_err(DaqError::Timecode)?;
        let minutes = MINUTES.read(info).map_err(DaqError::Timecode)?;
        let hours = HOURS.read(info).map_err(DaqError::Timecode)?;
        let day = DAYS.read(info).map_err(DaqError::Timecode)?
            + (info[DAY_HUNDREDS_WORD] & 0x1) * 100
            + ((info[DAY_HUNDREDS_WORD] >> 1) & 0x1) * 200;
        Self::new(day as u16, hours as u8, minutes as u8, seconds as u8)
    }

    /// Data words carrying this timecode; all other bits are zero.
    pub fn encode(&self) -> [u32; IRIG_DECADES] {
        let mut info = [0u32; IRIG_DECADES];
        SECONDS.write(&mut info, u32::from(self.seconds));
        MINUTES.write(&mut info, u32::from(self.minutes));
        HOURS.write(&mut info, u32::from(self.hours));
        let day = u32::from(self.day_of_year);
        DAYS.write(&mut info, day % 100);
        info[DAY_HUNDREDS_WORD] |= (day / 100) & 0x3;
        info
    }

    /// Symbol transmitted at `position` (0..100) of this frame.
    pub fn symbol_at(&self, position: usize) -> Symbol {
        if position == 0 || position % 10 == 9 {
            return Symbol::SyncPulse;
        }
        let info = self.encode();
        if (info[position / 10] >> (position % 10)) & 1 == 1 {
            Symbol::One
        } else {
            Symbol::Zero
        }
    }

    /// Seconds since midnight.
    pub fn seconds_of_day(&self) -> u32 {
        u32::from(self.hours) * 3600 + u32::from(self.minutes) * 60 + u32::from(self.seconds)
    }

    /// The timecode `seconds` later.
    pub fn advanced_by(&self, seconds: u64) -> Self {
        let total = u64::from(self.seconds_of_day()) + seconds;
        let days = total / u64::from(SECONDS_PER_DAY);
        let sod = (total % u64::from(SECONDS_PER_DAY)) as u32;
        let day_of_year =
            ((u64::from(self.day_of_year) - 1 + days) % u64::from(DAYS_PER_YEAR)) as u16 + 1;
        Self {
            day_of_year,
            hours: (sod / 3600) as u8,
            minutes: (sod / 60 % 60) as u8,
            seconds: (sod % 60) as u8,
        }
    }

    /// Wall-clock part as a `chrono` time.
    pub fn time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(
            u32::from(self.hours),
            u32::from(self.minutes),
            u32::from(self.seconds),
        )
        .unwrap_or_default()
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {}", self.day_of_year, self.time().format("%H:%M:%S"))
    }
}

/// Seconds from `start` to `now`, both seconds-of-day, wrapping at midnight.
pub fn elapsed_seconds(start: u32, now: u32) -> u32 {
    (now + SECONDS_PER_DAY - start % SECONDS_PER_DAY) % SECONDS_PER_DAY
}
