// Schedule parsing and time-of-day matching

use thermo_rs::schedule::{Schedule, ScheduleEntry, ScheduleError};
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_active_entry_wraps_overnight() {
    let schedule = Schedule::parse(&["06:00 20", "22:00 17"]).unwrap();
    assert_eq!(schedule.active_entry("07:00").unwrap().temperature, 20.0);
    assert_eq!(schedule.active_entry("23:00").unwrap().temperature, 17.0);
    // Before the first entry of the day: carried over from yesterday.
    assert_eq!(schedule.active_entry("05:00").unwrap().temperature, 17.0);
}

#[test]
fn test_rows_are_normalized_and_sorted() {
    let schedule = Schedule::parse(&["  22:00:00 17.5C ", "", "06:30 20c", "12:00 19"]).unwrap();
    let stamps: Vec<&str> = schedule.entries().iter().map(|e| e.timestamp.as_str()).collect();
    assert_eq!(stamps, vec!["06:30", "12:00", "22:00"]);
    assert_eq!(schedule.entries()[2].temperature, 17.5);
    assert_eq!(schedule.active_entry("12:00").unwrap().temperature, 19.0);
}

#[test]
fn test_single_entry_applies_all_day() {
    let schedule = assert_ok!(Schedule::parse(&["08:00 19"]));
    for now in ["00:00", "07:59", "08:00", "23:59"] {
        assert_eq!(schedule.active_entry(now).unwrap().temperature, 19.0);
    }
}

#[test]
fn test_malformed_rows_rejected() {
    assert!(matches!(ScheduleEntry::parse("0600 20"), Err(ScheduleError::InvalidTime(_))));
    assert!(matches!(ScheduleEntry::parse("25:00 20"), Err(ScheduleError::InvalidTime(_))));
    assert!(matches!(ScheduleEntry::parse("06:00 warm"), Err(ScheduleError::InvalidTemperature(_))));
    assert!(matches!(ScheduleEntry::parse("06:00"), Err(ScheduleError::MalformedRow(_))));
    assert_err!(Schedule::parse(&["06:00 20", "bogus"]));
}
