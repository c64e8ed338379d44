// Window Assignment
//
// Tumbling and hopping windows are aligned to the epoch and assigned
// purely from the record timestamp. Session windows depend on the sessions
// already held for the key: a record joins (and may bridge) every session
// that lies within the gap of it.

use crate::common::types::{Timestamp, Window};
use crate::query::plan::WindowExpression;

/// Windows of a time-windowed aggregation that contain `timestamp`, ordered by start.
/// Session windows are not time windows and yield nothing here.
pub fn time_windows_for(window: &WindowExpression, timestamp: Timestamp) -> Vec<Window> {
    match *window {
        WindowExpression::Tumbling { size } => {
            // floor, so negative timestamps land in the window below zero
            let start = timestamp - timestamp.rem_euclid(size);
            vec![Window::new(start, start + size)]
        }
        WindowExpression::Hopping { size, advance } => {
            let mut windows = Vec::new();
            let mut start = timestamp - timestamp.rem_euclid(advance);
            while start > timestamp - size {
                windows.push(Window::new(start, start + size));
                start -= advance;
            }
            windows.reverse();
            windows
        }
        WindowExpression::Session { .. } => Vec::new(),
    }
}

/// Outcome of placing one record into a key's sessions
#[derive(Debug, Clone, PartialEq)]
pub struct SessionAssignment {
    /// The session the record belongs to after merging
    pub window: Window,
    /// Existing sessions absorbed into `window`
    pub merged: Vec<Window>,
}

/// Place a record at `timestamp` among a key's existing sessions.
///
/// A session `[s, e]` absorbs the record when `e >= timestamp - gap` and
/// `s <= timestamp + gap`. Every such session is merged into the result.
pub fn session_window_for(existing: &[Window], timestamp: Timestamp, gap: Timestamp) -> SessionAssignment {
    let merged: Vec<Window> = existing
        .iter()
        .filter(|w| w.end >= timestamp - gap && w.start <= timestamp + gap)
        .copied()
        .collect();

    let start = merged.iter().map(|w| w.start).fold(timestamp, Timestamp::min);
    let end = merged.iter().map(|w| w.end).fold(timestamp, Timestamp::max);

    SessionAssignment {
        window: Window::new(start, end),
        merged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tumbling_boundaries() {
        let tumbling = WindowExpression::Tumbling { size: 10 };
        assert_eq!(time_windows_for(&tumbling, 0), vec![Window::new(0, 10)]);
        assert_eq!(time_windows_for(&tumbling, 9), vec![Window::new(0, 10)]);
        assert_eq!(time_windows_for(&tumbling, 10), vec![Window::new(10, 20)]);
        assert_eq!(time_windows_for(&tumbling, -1), vec![Window::new(-10, 0)]);
    }

    #[test]
    fn test_hopping_overlaps() {
        let hopping = WindowExpression::Hopping { size: 10, advance: 5 };
        assert_eq!(time_windows_for(&hopping, 7), vec![Window::new(0, 10), Window::new(5, 15)]);
        assert_eq!(time_windows_for(&hopping, 10), vec![Window::new(5, 15), Window::new(10, 20)]);
    }

    #[test]
    fn test_session_extend_and_split() {
        let first = session_window_for(&[], 0, 5);
        assert_eq!(first.window, Window::new(0, 0));

        let extended = session_window_for(&[first.window], 4, 5);
        assert_eq!(extended.window, Window::new(0, 4));
        assert_eq!(extended.merged, vec![Window::new(0, 0)]);

        let separate = session_window_for(&[extended.window], 10, 5);
        assert_eq!(separate.window, Window::new(10, 10));
        assert!(separate.merged.is_empty());
    }

    #[test]
    fn test_late_record_bridges_sessions() {
        let sessions = [Window::new(0, 4), Window::new(12, 15)];
        let bridged = session_window_for(&sessions, 8, 5);
        assert_eq!(bridged.window, Window::new(0, 15));
        assert_eq!(bridged.merged.len(), 2);
    }
}
