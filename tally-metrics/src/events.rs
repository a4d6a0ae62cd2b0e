use chrono::{DateTime, Datelike, NaiveTime, Utc};

use crate::time_frame::TimeWindow;

/// Key prefix used for counter keys in the cache.
const KEY_PREFIX: &str = "tally:usage";

/// Cache key version.
///
/// The version is embedded in the key as a static segment, increment the
/// version whenever there are breaking changes made to the keys or storage
/// format in the cache.
const KEY_VERSION: u32 = 1;

/// Number of weeks a calendar-bucketed counter key lives in the cache.
pub const KEY_EXPIRY_WEEKS: u64 = 6;

/// Maps a named telemetry event to the cache keys holding its counters.
///
/// Time-framed rules decompose the window into ISO-week buckets and produce
/// one key per `(event, week)` pair. Keys outside the requested window are
/// never derived, which enforces window correctness without filtering after
/// the fact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSelectionRule {
    /// The telemetry event name.
    pub event_name: String,
    /// Whether counters for this event are bucketed by calendar week.
    pub time_framed: bool,
    /// The identity attribute tracked for this event, if any.
    pub unique_identifier_name: Option<String>,
}

impl EventSelectionRule {
    /// Creates a time-framed rule for `event_name`.
    pub fn time_framed(event_name: &str) -> Self {
        Self {
            event_name: event_name.to_owned(),
            time_framed: true,
            unique_identifier_name: None,
        }
    }

    /// Creates a rule holding a single all-time counter.
    pub fn all_time(event_name: &str) -> Self {
        Self {
            event_name: event_name.to_owned(),
            time_framed: false,
            unique_identifier_name: None,
        }
    }

    /// The keys holding this event's counters for the given window.
    ///
    /// For a non-time-framed rule this is always the single all-time key. A
    /// time-framed rule resolved against an unbounded window would need every
    /// week that ever existed; since bucketed keys expire after
    /// [`KEY_EXPIRY_WEEKS`] anyway, definition validation rejects that
    /// combination before it gets here and the all-time key is returned as a
    /// conservative default.
    pub fn storage_keys(&self, window: &TimeWindow) -> Vec<String> {
        if !self.time_framed {
            return vec![self.all_time_key()];
        }

        match window {
            TimeWindow::Between { start, finish } => iso_weeks_between(*start, *finish)
                .into_iter()
                .map(|(year, week)| self.bucket_key(year, week))
                .collect(),
            TimeWindow::Point | TimeWindow::Unbounded => vec![self.all_time_key()],
        }
    }

    /// The key written when this event fires at instant `at`.
    pub fn tracking_key(&self, at: DateTime<Utc>) -> String {
        if self.time_framed {
            let week = at.date_naive().iso_week();
            self.bucket_key(week.year(), week.week())
        } else {
            self.all_time_key()
        }
    }

    /// The stable period labels of the window's buckets, shared with
    /// database-persisted sketches for cross-source merging.
    pub fn period_labels(&self, window: &TimeWindow) -> Vec<String> {
        match window {
            TimeWindow::Between { start, finish } => iso_weeks_between(*start, *finish)
                .into_iter()
                .map(|(year, week)| format!("{year}-{week:02}"))
                .collect(),
            TimeWindow::Point | TimeWindow::Unbounded => vec!["all".to_owned()],
        }
    }

    fn all_time_key(&self) -> String {
        format!("{KEY_PREFIX}:{KEY_VERSION}:{}", self.event_name)
    }

    fn bucket_key(&self, year: i32, week: u32) -> String {
        format!("{KEY_PREFIX}:{KEY_VERSION}:{}-{year}-{week:02}", self.event_name)
    }
}

/// The distinct ISO `(year, week)` pairs touched by `[start, finish)`.
fn iso_weeks_between(start: DateTime<Utc>, finish: DateTime<Utc>) -> Vec<(i32, u32)> {
    let mut weeks = Vec::new();

    // The finish instant is exclusive; a finish at exactly midnight does not
    // touch its calendar day.
    let last = if finish.time() == NaiveTime::MIN {
        finish.date_naive().pred_opt()
    } else {
        Some(finish.date_naive())
    };
    let Some(last) = last else {
        return weeks;
    };

    let mut day = start.date_naive();
    while day <= last {
        let iso = day.iso_week();
        let pair = (iso.year(), iso.week());
        if weeks.last() != Some(&pair) {
            weeks.push(pair);
        }
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }

    weeks
}
