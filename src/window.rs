//! Event-time windowing primitives.
//!
//! This module defines the core types used by the windowed aggregation
//! subsystem:
//!
//! - [`TimestampMs`]: a millisecond-precision timestamp since the Unix epoch (UTC).
//! - [`Window`]: a **closed–open** time interval `[start, end)` tagged with its
//!   [`WindowKind`], with total ordering and hashing, so it can be used as a
//!   key and sorted deterministically.
//! - [`WindowAssigner`]: the tumbling / sliding / session assignment rules.
//!
//! ## Tumbling windows
//! [`Window::tumble`] computes the tumbling window that contains a given
//! timestamp, parameterized by a **window size** (`size_ms`) and an
//! **alignment offset** (`offset_ms`). Windows are aligned so that valid
//! window starts are:
//!
//! ```text
//! offset_ms + k * size_ms, for integer k
//! ```
//!
//! For example, with `size_ms = 10` and `offset_ms = 0`, the timestamp `27`
//! falls into the window `[20, 30)`. With `offset_ms = 5`, the same timestamp
//! falls into `[25, 35)`.
//!
//! ## Sliding windows
//! A timestamp belongs to every window `[start, start + size)` whose start is
//! a multiple of `step_ms` and which contains it; there are
//! `ceil(size / step)` such windows.
//!
//! ## Session windows
//! A session opens as `[t, t + gap)` and is extended by each item arriving
//! within the gap of its current end. Sessions that become contiguous are
//! merged by the aggregation subsystem, which owns the per-key window state.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Milliseconds since the Unix epoch (UTC).
///
/// This alias is used throughout the API to clarify when values represent
/// event-time timestamps.
pub type TimestampMs = u64;

/// Which assignment rule produced a window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WindowKind {
    /// Disjoint fixed-size windows.
    Tumbling,
    /// Overlapping fixed-size windows.
    Sliding,
    /// Gap-extended windows.
    Session,
}

/// A closed–open time interval: `[start, end)`.
///
/// Windows are comparable and hashable, which makes them usable as map keys
/// and sortable in a deterministic order (by `start`, then `end`).
#[derive(Copy, Clone, Debug, Serialize, Deserialize, Eq)]
pub struct Window {
    /// Inclusive window start (milliseconds since epoch).
    pub start: TimestampMs,
    /// Exclusive window end (milliseconds since epoch).
    pub end: TimestampMs,
    /// Which assignment rule produced this window.
    pub kind: WindowKind,
}

impl Window {
    /// Construct a window `[start, end)`. Panics in debug builds if `end < start`.
    #[inline]
    pub fn new(start: TimestampMs, end: TimestampMs, kind: WindowKind) -> Self {
        debug_assert!(end >= start);
        Self { start, end, kind }
    }

    /// Compute the **tumbling** window for a timestamp.
    ///
    /// The returned window has length `size_ms` and is aligned so that all
    /// window starts are of the form `offset_ms + k * size_ms` for integer `k`.
    ///
    /// # Example
    /// ```
    /// use npipeline::window::{Window, WindowKind};
    /// let w = Window::tumble(27, 10, 0);
    /// assert_eq!((w.start, w.end), (20, 30));
    ///
    /// let w2 = Window::tumble(27, 10, 5);
    /// assert_eq!((w2.start, w2.end), (25, 35));
    /// ```
    #[inline]
    pub fn tumble(ts: TimestampMs, size_ms: u64, offset_ms: u64) -> Self {
        debug_assert!(size_ms > 0);
        // Position relative to the offset; windows start at offset + k*size.
        let rel = ts.saturating_sub(offset_ms);
        let k = rel / size_ms;
        let win_start = k * size_ms + offset_ms;
        Self::new(win_start, win_start + size_ms, WindowKind::Tumbling)
    }

    /// The initial session window opened by an item at `ts`.
    #[inline]
    pub fn session(ts: TimestampMs, gap_ms: u64) -> Self {
        Self::new(ts, ts + gap_ms, WindowKind::Session)
    }

    /// True if `ts` lies inside `[start, end)`.
    #[inline]
    pub fn contains(&self, ts: TimestampMs) -> bool {
        self.start <= ts && ts < self.end
    }
}

// Hash/Ord so `Window` can be used as keys and sorted deterministically.
impl PartialEq for Window {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start && self.end == other.end && self.kind == other.kind
    }
}
impl Hash for Window {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.start.hash(state);
        self.end.hash(state);
        self.kind.hash(state);
    }
}
impl Ord for Window {
    #[inline]
    fn cmp(&self, o: &Self) -> Ordering {
        self.start
            .cmp(&o.start)
            .then(self.end.cmp(&o.end))
            .then(self.kind.cmp(&o.kind))
    }
}
impl PartialOrd for Window {
    #[inline]
    fn partial_cmp(&self, o: &Self) -> Option<Ordering> {
        Some(self.cmp(o))
    }
}

/// Assignment rule used by an aggregate node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowAssigner {
    /// Disjoint windows of `size_ms`.
    Tumbling {
        /// Window length in milliseconds.
        size_ms: u64,
    },
    /// Overlapping windows of `size_ms` starting every `step_ms`.
    Sliding {
        /// Window length in milliseconds.
        size_ms: u64,
        /// Distance between consecutive window starts.
        step_ms: u64,
    },
    /// Gap-extended session windows.
    Session {
        /// Inactivity gap closing a session.
        gap_ms: u64,
    },
}

impl WindowAssigner {
    /// The kind of windows this assigner produces.
    #[inline]
    pub fn kind(&self) -> WindowKind {
        match self {
            WindowAssigner::Tumbling { .. } => WindowKind::Tumbling,
            WindowAssigner::Sliding { .. } => WindowKind::Sliding,
            WindowAssigner::Session { .. } => WindowKind::Session,
        }
    }

    /// Reject degenerate parameters.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            WindowAssigner::Tumbling { size_ms } if size_ms == 0 => {
                Err("tumbling window size must be > 0".into())
            }
            WindowAssigner::Sliding { size_ms, step_ms } if size_ms == 0 || step_ms == 0 => {
                Err("sliding window size and step must be > 0".into())
            }
            WindowAssigner::Session { gap_ms } if gap_ms == 0 => {
                Err("session gap must be > 0".into())
            }
            _ => Ok(()),
        }
    }

    /// Candidate windows for an item at `ts`, ascending by start.
    ///
    /// Session assignment depends on existing per-key state and is handled
    /// by the aggregation subsystem; here it returns the initial session
    /// `[ts, ts + gap)`.
    pub fn assign(&self, ts: TimestampMs) -> Vec<Window> {
        match *self {
            WindowAssigner::Tumbling { size_ms } => vec![Window::tumble(ts, size_ms, 0)],
            WindowAssigner::Sliding { size_ms, step_ms } => {
                let mut windows = Vec::with_capacity((size_ms.div_ceil(step_ms)) as usize);
                let mut start = (ts / step_ms) * step_ms;
                loop {
                    if start + size_ms > ts {
                        windows.push(Window::new(start, start + size_ms, WindowKind::Sliding));
                    } else {
                        break;
                    }
                    if start < step_ms {
                        break;
                    }
                    start -= step_ms;
                }
                windows.reverse();
                windows
            }
            WindowAssigner::Session { gap_ms } => vec![Window::session(ts, gap_ms)],
        }
    }
}

/// An event-time stamped element.
///
/// This is a lightweight carrier for values that participates in windowing
/// transforms; sources that already know their event times can emit it
/// directly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timestamped<T> {
    /// Event-time timestamp (milliseconds since epoch).
    pub ts: TimestampMs,
    /// The associated value.
    pub value: T,
}

impl<T> Timestamped<T> {
    /// Construct a new [`Timestamped`] value.
    #[inline]
    pub fn new(ts: TimestampMs, value: T) -> Self {
        Self { ts, value }
    }
}
