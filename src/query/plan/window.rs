use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::types::{Timestamp, WindowType};

/// Windowing clause of a windowed aggregation. Durations are milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowExpression {
    Tumbling { size: Timestamp },
    Hopping { size: Timestamp, advance: Timestamp },
    Session { gap: Timestamp },
}

impl WindowExpression {
    pub fn window_type(&self) -> WindowType {
        match self {
            WindowExpression::Tumbling { .. } => WindowType::Tumbling,
            WindowExpression::Hopping { .. } => WindowType::Hopping,
            WindowExpression::Session { .. } => WindowType::Session,
        }
    }

    /// Fixed window size, if windows have one
    pub fn size(&self) -> Option<Timestamp> {
        match self {
            WindowExpression::Tumbling { size } | WindowExpression::Hopping { size, .. } => Some(*size),
            WindowExpression::Session { .. } => None,
        }
    }

    pub fn window_info(&self) -> WindowInfo {
        WindowInfo {
            window_type: self.window_type(),
            size: self.size(),
        }
    }

    /// Check the durations are usable; returns a description of the problem otherwise
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            WindowExpression::Tumbling { size } if size <= 0 => Err(format!("window size must be positive, was {}", size)),
            WindowExpression::Hopping { size, advance } if size <= 0 || advance <= 0 => Err(format!(
                "window size and advance must be positive, were {} and {}",
                size, advance
            )),
            WindowExpression::Hopping { size, advance } if advance > size => Err(format!(
                "window advance {} must not exceed window size {}",
                advance, size
            )),
            WindowExpression::Session { gap } if gap <= 0 => Err(format!("session gap must be positive, was {}", gap)),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for WindowExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowExpression::Tumbling { size } => write!(f, "TUMBLING (SIZE {} MILLISECONDS)", size),
            WindowExpression::Hopping { size, advance } => {
                write!(f, "HOPPING (SIZE {} MILLISECONDS, ADVANCE BY {} MILLISECONDS)", size, advance)
            }
            WindowExpression::Session { gap } => write!(f, "SESSION ({} MILLISECONDS)", gap),
        }
    }
}

/// What a reader of a windowed key needs to know to rebuild its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowInfo {
    pub window_type: WindowType,
    /// Size of time windows; session windows carry their end explicitly
    pub size: Option<Timestamp>,
}
