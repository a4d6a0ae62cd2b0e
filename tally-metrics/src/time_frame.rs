use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use tally_database::TimeConstraint;

/// Days excluded at the recent edge of a trailing window.
///
/// The most recent days are still accumulating events; counting them would
/// make consecutive report runs disagree for reasons that have nothing to do
/// with usage.
const EXCLUSION_BUFFER_DAYS: i64 = 2;

/// An unsupported time frame symbol.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown time frame `{0}`")]
pub struct UnknownTimeFrameError(pub String);

/// A symbolic time window over which a metric is computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimeFrame {
    /// The time dimension is irrelevant; the metric is a point-in-time value.
    None,
    /// All recorded history.
    All,
    /// A trailing seven-day window.
    Days7,
    /// A trailing twenty-eight-day window.
    Days28,
}

impl TimeFrame {
    /// Parses a time frame symbol from the metric catalog.
    pub fn parse(symbol: &str) -> Result<Self, UnknownTimeFrameError> {
        match symbol {
            "none" => Ok(Self::None),
            "all" => Ok(Self::All),
            "7d" => Ok(Self::Days7),
            "28d" => Ok(Self::Days28),
            other => Err(UnknownTimeFrameError(other.to_owned())),
        }
    }

    /// The catalog symbol of this time frame.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::All => "all",
            Self::Days7 => "7d",
            Self::Days28 => "28d",
        }
    }

    /// Whether metrics in this frame decompose into calendar buckets.
    pub fn is_bucketed(&self) -> bool {
        matches!(self, Self::Days7 | Self::Days28)
    }

    /// Resolves the symbolic frame to a concrete window anchored at `now`.
    ///
    /// Trailing frames resolve to `[now - N days, now - 2 days)`: the window
    /// ends two days before `now` to exclude partial, still-accumulating
    /// days.
    pub fn resolve(&self, now: DateTime<Utc>) -> TimeWindow {
        let trailing = |days: i64| {
            let finish = now - Duration::days(EXCLUSION_BUFFER_DAYS);
            TimeWindow::Between {
                start: finish - Duration::days(days),
                finish,
            }
        };

        match self {
            Self::None => TimeWindow::Point,
            Self::All => TimeWindow::Unbounded,
            Self::Days7 => trailing(7),
            Self::Days28 => trailing(28),
        }
    }
}

/// A resolved time window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeWindow {
    /// No time dimension; compute a point-in-time value.
    Point,
    /// All recorded history.
    Unbounded,
    /// The half-open instant range `[start, finish)`.
    Between {
        /// Inclusive start of the window.
        start: DateTime<Utc>,
        /// Exclusive end of the window.
        finish: DateTime<Utc>,
    },
}

impl TimeWindow {
    /// Converts the window into a relational time constraint on `column`.
    ///
    /// Returns `None` when the window does not constrain anything.
    pub fn constraint(&self, column: &str) -> Option<TimeConstraint> {
        match self {
            Self::Point | Self::Unbounded => None,
            Self::Between { start, finish } => {
                Some(TimeConstraint::between(column, *start, *finish))
            }
        }
    }

    /// A stable label describing this window, used as the time period of
    /// persisted sketches.
    pub fn period_label(&self) -> String {
        match self {
            Self::Point => "point".to_owned(),
            Self::Unbounded => "all".to_owned(),
            Self::Between { start, finish } => {
                format!("{}..{}", start.date_naive(), finish.date_naive())
            }
        }
    }
}
