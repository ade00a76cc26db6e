//! # Wake Scheduler
//!
//! Decides when the device should next wake and which endpoint to request.
//! The scheduler is a pure function of its inputs: no I/O, no global clock,
//! no failure path. Malformed configuration degrades to the top-of-hour
//! fallback so a device can never stay awake for want of a wake time.
//!
//! ## Decision Order
//! 1. No usable sleep window: earliest of the next labeled wake and the next
//!    interval boundary (labeled wake wins ties).
//! 2. Currently inside the sleep window: wake at the window's stop time.
//! 3. Otherwise as in (1), but a candidate that lands inside the window is
//!    pushed to the window's stop time and served from the default endpoint.
//!
//! Calendar arithmetic happens in whatever zone the caller's `DateTime`
//! carries; the device clock is assumed to be localized already. Daylight
//! saving transitions are not specially handled: a label that falls in a
//! skipped hour is resolved with the offset in force at `now`.

use crate::clock::{parse_duration, ClockTime, SleepWindow};
use chrono::{DateTime, Duration, LocalResult, NaiveDate, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Time-of-day label → endpoint. `BTreeMap` keeps iteration ordered by label,
/// which is also the tie-break order.
pub type Schedule = BTreeMap<String, String>;

/// The scheduler's output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeDecision {
    /// Absolute wake time, seconds since the Unix epoch.
    pub epoch: i64,
    /// Endpoint to request on that wake.
    pub endpoint: String,
    /// Schedule label that produced the decision, if any.
    pub source_label: Option<String>,
}

/// A labeled wake candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabeledWake {
    pub epoch: i64,
    pub label: String,
    pub endpoint: String,
}

/// Inputs that stay fixed across wake cycles.
#[derive(Clone, Copy, Debug)]
pub struct ScheduleInputs<'a> {
    pub sleep_window: Option<SleepWindow>,
    pub schedule: &'a Schedule,
    pub default_endpoint: &'a str,
    pub fallback_interval: &'a str,
}

/// Resolve a wall-clock date/time in `now`'s zone.
///
/// Ambiguous times take the earlier instant. Nonexistent times (spring-forward
/// gaps) are interpreted with `now`'s UTC offset.
fn at_clock_time<Tz: TimeZone>(now: &DateTime<Tz>, date: NaiveDate, time: ClockTime) -> i64 {
    let naive = date
        .and_hms_opt(time.hour as u32, time.minute as u32, 0)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::MIN));
    match now.timezone().from_local_datetime(&naive) {
        LocalResult::Single(t) => t.timestamp(),
        LocalResult::Ambiguous(earliest, _) => earliest.timestamp(),
        LocalResult::None => {
            let offset = now.fixed_offset().offset().local_minus_utc() as i64;
            naive.and_utc().timestamp() - offset
        }
    }
}

fn minute_of_day<Tz: TimeZone>(t: &DateTime<Tz>) -> u16 {
    (t.hour() * 60 + t.minute()) as u16
}

/// `now` plus the configured interval, or the next top of the hour when the
/// interval is empty, zero or unparseable.
pub fn next_interval_boundary<Tz: TimeZone>(now: &DateTime<Tz>, fallback_interval: &str) -> i64 {
    let now_epoch = now.timestamp();
    if let Ok(seconds) = parse_duration(fallback_interval) {
        return now_epoch + i64::from(seconds);
    }

    // truncating to the hour never lands after now, so the next one is always +1h
    let into_hour = i64::from(now.minute()) * 60 + i64::from(now.second());
    now_epoch - into_hour + 3600
}

/// The earliest labeled wake strictly after `now`.
///
/// Labels that do not parse as clock times are skipped. Each candidate is
/// placed on `now`'s calendar day and moved 24 hours forward if it is not
/// strictly in the future. Equal candidates resolve to the smaller label.
pub fn next_labeled_wake<Tz: TimeZone>(now: &DateTime<Tz>, schedule: &Schedule) -> Option<LabeledWake> {
    let now_epoch = now.timestamp();
    let today = now.date_naive();

    let mut best: Option<LabeledWake> = None;
    for (label, endpoint) in schedule {
        let Ok(time) = ClockTime::parse(label) else {
            tracing::debug!(label = %label, "skipping unparseable wake label");
            continue;
        };

        let mut candidate = at_clock_time(now, today, time);
        if candidate <= now_epoch {
            candidate += 24 * 3600;
        }

        let better = match &best {
            None => true,
            Some(b) => candidate < b.epoch || (candidate == b.epoch && label < &b.label),
        };
        if better {
            best = Some(LabeledWake {
                epoch: candidate,
                label: label.clone(),
                endpoint: endpoint.clone(),
            });
        }
    }
    best
}

/// The window's stop time on `reference`'s calendar day, or the next day if
/// that is not strictly after `after`.
fn window_stop_after<Tz: TimeZone>(reference: &DateTime<Tz>, stop: ClockTime, after: i64) -> i64 {
    let day = reference.date_naive();
    let stop_epoch = at_clock_time(reference, day, stop);
    if stop_epoch > after {
        return stop_epoch;
    }
    match day.succ_opt() {
        Some(next) => at_clock_time(reference, next, stop),
        None => stop_epoch + 24 * 3600,
    }
}

/// Earliest of labeled wake and interval boundary, without any window.
fn earliest_trigger<Tz: TimeZone>(now: &DateTime<Tz>, inputs: &ScheduleInputs<'_>) -> WakeDecision {
    let interval = next_interval_boundary(now, inputs.fallback_interval);
    match next_labeled_wake(now, inputs.schedule) {
        Some(labeled) if labeled.epoch <= interval => WakeDecision {
            epoch: labeled.epoch,
            endpoint: labeled.endpoint,
            source_label: Some(labeled.label),
        },
        _ => WakeDecision {
            epoch: interval,
            endpoint: inputs.default_endpoint.to_string(),
            source_label: None,
        },
    }
}

/// Compute the next wake time and endpoint.
///
/// The returned epoch is always strictly after `now`.
pub fn calculate_next_wake<Tz: TimeZone>(now: &DateTime<Tz>, inputs: &ScheduleInputs<'_>) -> WakeDecision {
    let Some(window) = inputs.sleep_window else {
        return earliest_trigger(now, inputs);
    };

    let now_epoch = now.timestamp();
    if window.contains_minute(minute_of_day(now)) {
        return WakeDecision {
            epoch: window_stop_after(now, window.stop, now_epoch),
            endpoint: inputs.default_endpoint.to_string(),
            source_label: None,
        };
    }

    let chosen = earliest_trigger(now, inputs);
    let Some(chosen_at) = DateTime::from_timestamp(chosen.epoch, 0)
        .map(|utc| utc.with_timezone(&now.timezone()))
    else {
        return chosen;
    };

    if !window.contains_minute(minute_of_day(&chosen_at)) {
        return chosen;
    }

    let clamped = window_stop_after(&chosen_at, window.stop, chosen.epoch);
    tracing::debug!(
        from = chosen.epoch,
        to = clamped,
        "wake candidate falls inside sleep window, deferring to window stop"
    );
    WakeDecision {
        epoch: clamped,
        endpoint: inputs.default_endpoint.to_string(),
        source_label: None,
    }
}
