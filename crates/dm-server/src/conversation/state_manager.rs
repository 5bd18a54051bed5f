//! Session timing table

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::config::{SessionConfiguration, DEFAULT_P2_STAR_TIME, DEFAULT_P2_TIME};

/// Well-known diagnostic session identifiers (ISO 14229-1, 0x10 sub-functions)
pub mod session_id {
    pub const DEFAULT: u8 = 0x01;
    pub const PROGRAMMING: u8 = 0x02;
    pub const EXTENDED: u8 = 0x03;
    pub const SAFETY_SYSTEM: u8 = 0x04;
}

/// P2 / P2* of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub p2: Duration,
    pub p2_star: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            p2: DEFAULT_P2_TIME,
            p2_star: DEFAULT_P2_STAR_TIME,
        }
    }
}

/// Maps session ids to their timing, built once from configuration
#[derive(Debug, Clone, Default)]
pub struct StateManager {
    sessions: HashMap<u8, SessionTiming>,
}

impl StateManager {
    pub fn new(sessions: &[SessionConfiguration]) -> Self {
        let sessions = sessions
            .iter()
            .map(|s| {
                debug!(
                    session = format!("0x{:02X}", s.id),
                    p2_ms = s.p2_time_ms,
                    p2_star_ms = s.p2_star_time_ms,
                    "Session timing"
                );
                (
                    s.id,
                    SessionTiming {
                        p2: Duration::from_millis(s.p2_time_ms),
                        p2_star: Duration::from_millis(s.p2_star_time_ms),
                    },
                )
            })
            .collect();
        Self { sessions }
    }

    /// Whether the session is configured
    pub fn contains(&self, session: u8) -> bool {
        self.sessions.contains_key(&session)
    }

    pub fn timing(&self, session: u8) -> Option<SessionTiming> {
        self.sessions.get(&session).copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
