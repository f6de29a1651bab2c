#![no_main]

use chrono::{Duration, NaiveDate};
use libfuzzer_sys::fuzz_target;
use watchkeep_core::config::Config;
use watchkeep_core::schedule::ScheduleResolver;

// Any config that parses and validates must resolve at every hour without
// panicking, and suspended capture must report a zero interval.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = Config::parse(text, Some("toml")) else {
        return;
    };
    if config.validate().is_err() {
        return;
    }

    let Some(start) = NaiveDate::from_ymd_opt(2026, 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0)) else {
        return;
    };
    let resolver = ScheduleResolver::new(config.schedule);
    for hour in 0..48 {
        let effective = resolver.resolve(start + Duration::hours(hour));
        if !effective.capture_enabled {
            assert_eq!(effective.interval_minutes, 0);
        }
    }
    let _ = resolver.transitions(start, Duration::hours(48));
});
