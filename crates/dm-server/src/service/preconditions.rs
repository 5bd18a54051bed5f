//! Session and security level preconditions

use crate::config::PreconditionsConfiguration;
use crate::conversation::AccessState;

/// Sessions and security levels an operation is allowed in
///
/// An empty list leaves that dimension unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    sessions: Vec<u8>,
    security_levels: Vec<u8>,
}

impl Preconditions {
    pub fn new(sessions: Vec<u8>, security_levels: Vec<u8>) -> Self {
        Self {
            sessions,
            security_levels,
        }
    }

    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn session_allowed(&self, state: &AccessState) -> bool {
        self.sessions.is_empty() || self.sessions.contains(&state.session)
    }

    pub fn security_allowed(&self, state: &AccessState) -> bool {
        self.security_levels.is_empty() || self.security_levels.contains(&state.security_level)
    }
}

impl From<&PreconditionsConfiguration> for Preconditions {
    fn from(config: &PreconditionsConfiguration) -> Self {
        Self::new(config.sessions.clone(), config.security_levels.clone())
    }
}

impl From<Option<&PreconditionsConfiguration>> for Preconditions {
    fn from(config: Option<&PreconditionsConfiguration>) -> Self {
        config.map(Self::from).unwrap_or_default()
    }
}
