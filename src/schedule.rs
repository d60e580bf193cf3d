// src/schedule.rs - Time-of-day setpoint schedule
use chrono::NaiveTime;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("Malformed schedule row '{0}': expected 'HH:MM <temperature>'")]
    MalformedRow(String),
    #[error("Invalid time '{0}': expected HH:MM")]
    InvalidTime(String),
    #[error("Invalid temperature '{0}'")]
    InvalidTemperature(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    /// Always five characters, "HH:MM".
    pub timestamp: String,
    pub temperature: f64,
}

impl ScheduleEntry {
    /// Parse a row such as `"06:00 20C"` or `"22:00:00 17.5"`.
    pub fn parse(row: &str) -> Result<Self, ScheduleError> {
        let row = row.trim();
        let (time, temp) = row
            .split_once(char::is_whitespace)
            .ok_or_else(|| ScheduleError::MalformedRow(row.to_string()))?;
        let timestamp = normalize_time(time.trim())?;
        let temp = temp.trim().to_lowercase();
        let temperature = temp
            .trim_end_matches('c')
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite())
            .ok_or_else(|| ScheduleError::InvalidTemperature(temp.clone()))?;
        Ok(Self { timestamp, temperature })
    }
}

/// Truncate to "HH:MM" (seconds are dropped) and check it is a real time of day.
fn normalize_time(time: &str) -> Result<String, ScheduleError> {
    let invalid = || ScheduleError::InvalidTime(time.to_string());
    let hhmm = time.get(0..5).ok_or_else(invalid)?;
    let digits = hhmm
        .char_indices()
        .all(|(i, c)| if i == 2 { c == ':' } else { c.is_ascii_digit() });
    if !digits {
        return Err(invalid());
    }
    let parsed = NaiveTime::parse_from_str(hhmm, "%H:%M").map_err(|_| invalid())?;
    Ok(parsed.format("%H:%M").to_string())
}

/// Entries sorted ascending by time of day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schedule {
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    pub fn new(mut entries: Vec<ScheduleEntry>) -> Self {
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Self { entries }
    }

    /// Parse configuration rows; blank rows are skipped.
    pub fn parse<S: AsRef<str>>(rows: &[S]) -> Result<Self, ScheduleError> {
        let entries = rows
            .iter()
            .map(AsRef::as_ref)
            .filter(|row| !row.trim().is_empty())
            .map(ScheduleEntry::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(entries))
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry with the greatest timestamp `<= now`. Before the first entry of the
    /// day the last entry still applies (carried over from the previous day).
    pub fn active_entry(&self, now: &str) -> Option<&ScheduleEntry> {
        self.entries
            .iter()
            .take_while(|entry| entry.timestamp.as_str() <= now)
            .last()
            .or_else(|| self.entries.last())
    }
}
