use std::fmt;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initialized,
    Appending,
    FinalizePending,
    Processing,
    Succeeded,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Failed) => true,
            (Initialized, Appending) => true,
            (Appending, FinalizePending) => true,
            (FinalizePending, Processing) | (FinalizePending, Succeeded) => true,
            (Processing, Processing) | (Processing, Succeeded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State of one media upload, from INIT until it succeeds or fails.
/// Never persisted.
#[derive(Debug)]
pub struct UploadSession {
    pub session_id: String,
    pub media_id: String,
    pub total_bytes: u64,
    pub mime_type: &'static str,
    bytes_appended: u64,
    segments: u32,
    polls: u32,
    state: SessionState,
}

impl UploadSession {
    pub fn new(media_id: String, total_bytes: u64, mime_type: &'static str) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            media_id,
            total_bytes,
            mime_type,
            bytes_appended: 0,
            segments: 0,
            polls: 0,
            state: SessionState::Initialized,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    pub fn segments(&self) -> u32 {
        self.segments
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn advance(&mut self, next: SessionState) -> AppResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if self.state != next {
            log::debug!(
                "Upload session {} ({}): {} -> {}",
                self.session_id,
                self.media_id,
                self.state,
                next
            );
        }
        self.state = next;
        Ok(())
    }

    /// Moves to `Failed` unless the session already ended.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            log::debug!(
                "Upload session {} ({}): {} -> Failed",
                self.session_id,
                self.media_id,
                self.state
            );
            self.state = SessionState::Failed;
        }
    }

    /// Zero-based index for the next APPEND
    pub fn next_segment_index(&self) -> u32 {
        self.segments
    }

    /// Accounts for an APPEND the server acknowledged.
    pub fn record_segment(&mut self, len: usize) -> AppResult<()> {
        if self.state != SessionState::Appending {
            return Err(AppError::InvalidTransition {
                from: self.state.to_string(),
                to: SessionState::Appending.to_string(),
            });
        }
        self.bytes_appended += len as u64;
        self.segments += 1;
        Ok(())
    }

    pub fn record_poll(&mut self) {
        self.polls += 1;
    }

    /// Bytes streamed must equal the size declared at INIT.
    pub fn verify_complete(&self) -> AppResult<()> {
        if self.bytes_appended != self.total_bytes {
            return Err(AppError::PayloadSizeMismatch {
                declared: self.total_bytes,
                streamed: self.bytes_appended,
            });
        }
        Ok(())
    }
}
