//! Per-user conversation state.
//!
//! A user's entry is created by a new source, walks through
//! `choosing-operation → awaiting-*`, and is removed the moment an operation
//! starts (single-shot) or the user cancels. Removal goes through
//! `DashMap::remove_if`, so of two racing presses of the same button exactly
//! one gets the state and the other sees `SessionExpired`.

mod source;

pub use source::{Source, classify_link};

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::debug;

use crate::acquire::{AcquiredFile, FormatOption};
use crate::jobs::JobKind;
use crate::transcode::StreamInfo;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Idle,
    ChoosingOperation,
    AwaitingSubtitle,
    AwaitingResolution,
    AwaitingCompressTarget,
    /// Stream-manifest download waiting for a quality pick.
    AwaitingFormat,
    /// Stream extraction waiting for a stream + format pick.
    AwaitingStream,
}

impl Phase {
    /// What the user should send next.
    pub fn expects(&self) -> &'static str {
        match self {
            Self::Idle => "a video, link or torrent",
            Self::ChoosingOperation => "an operation choice",
            Self::AwaitingSubtitle => "a subtitle file or link",
            Self::AwaitingResolution => "a resolution",
            Self::AwaitingCompressTarget => "a target size in MB",
            Self::AwaitingFormat => "a quality choice",
            Self::AwaitingStream => "a stream and format choice",
        }
    }

    fn for_operation(op: JobKind) -> Option<Self> {
        match op {
            JobKind::SubtitleBurn => Some(Self::AwaitingSubtitle),
            JobKind::ResolutionChange => Some(Self::AwaitingResolution),
            JobKind::Compress => Some(Self::AwaitingCompressTarget),
            JobKind::AcquireOnly | JobKind::StreamExtract | JobKind::MediaInfo => None,
        }
    }
}

/// Operation-specific scratch data.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    pub formats: Vec<FormatOption>,
    /// Title reported by the extractor's listing.
    pub title: Option<String>,
    pub streams: Vec<StreamInfo>,
    /// Already-acquired input kept for a follow-up pick; deleted with the last clone.
    pub cached_input: Option<Arc<AcquiredFile>>,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    /// Minted per source; stale buttons carry an old token.
    pub token: String,
    pub phase: Phase,
    pub source: Source,
    pub operation: Option<JobKind>,
    pub scratch: Scratch,
}

impl SessionState {
    fn new(source: Source) -> Self {
        Self {
            token: new_token(),
            phase: Phase::ChoosingOperation,
            source,
            operation: None,
            scratch: Scratch::default(),
        }
    }

    fn token_matches(&self, token: Option<&str>) -> bool {
        token.is_none_or(|t| t == self.token)
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Outcome of an operation choice.
#[derive(Debug)]
pub enum Choice {
    /// Stay in the session and wait for a parameter.
    Await(Phase),
    /// Start now; the session has been cleared.
    Execute(SessionState),
    /// Stream-manifest download: list formats first, then `offer_formats`.
    ListFormats { token: String, address: String },
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, SessionState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new source, replacing any previous state. Returns the new
    /// token and the replaced state, if any.
    pub fn begin(&self, user: &str, source: Source) -> (String, Option<SessionState>) {
        let state = SessionState::new(source);
        let token = state.token.clone();
        let replaced = self.sessions.insert(user.to_string(), state);
        debug!(user, token = %token, replaced = replaced.is_some(), "Session started");
        (token, replaced)
    }

    /// Apply an operation choice.
    pub fn choose(&self, user: &str, op: JobKind, token: Option<&str>) -> Result<Choice> {
        let mut entry = self.sessions.get_mut(user).ok_or(Error::SessionExpired)?;
        if !entry.token_matches(token) {
            return Err(Error::SessionExpired);
        }
        entry.operation = Some(op);
        entry.scratch = Scratch::default();

        if let Some(phase) = Phase::for_operation(op) {
            entry.phase = phase;
            return Ok(Choice::Await(phase));
        }
        let manifest = match &entry.source {
            Source::StreamManifest { address } if op == JobKind::AcquireOnly => Some(address.clone()),
            _ => None,
        };
        if let Some(address) = manifest {
            entry.phase = Phase::ChoosingOperation;
            return Ok(Choice::ListFormats {
                token: entry.token.clone(),
                address,
            });
        }
        drop(entry);

        self.take(user, None, token).map(Choice::Execute)
    }

    /// Store a format list for a pending stream-manifest download.
    pub fn offer_formats(
        &self,
        user: &str,
        token: &str,
        formats: Vec<FormatOption>,
        title: Option<String>,
    ) -> Result<()> {
        let mut entry = self.sessions.get_mut(user).ok_or(Error::SessionExpired)?;
        if entry.token != token || entry.operation != Some(JobKind::AcquireOnly) {
            return Err(Error::SessionExpired);
        }
        entry.scratch.formats = formats;
        entry.scratch.title = title;
        entry.phase = Phase::AwaitingFormat;
        Ok(())
    }

    /// Re-open a session waiting for a stream pick, unless the user has moved
    /// on to another source in the meantime. Returns the new token.
    pub fn await_stream_choice(
        &self,
        user: &str,
        source: Source,
        input: Arc<AcquiredFile>,
        streams: Vec<StreamInfo>,
    ) -> Option<String> {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(user.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let mut state = SessionState::new(source);
                state.phase = Phase::AwaitingStream;
                state.operation = Some(JobKind::StreamExtract);
                state.scratch.streams = streams;
                state.scratch.cached_input = Some(input);
                let token = state.token.clone();
                slot.insert(state);
                Some(token)
            }
        }
    }

    /// Atomically remove the state if it is in `phase` (any phase when `None`)
    /// and the token matches.
    pub fn take(&self, user: &str, phase: Option<Phase>, token: Option<&str>) -> Result<SessionState> {
        let removed = self.sessions.remove_if(user, |_, s| {
            phase.is_none_or(|p| s.phase == p) && s.token_matches(token)
        });
        if let Some((_, state)) = removed {
            return Ok(state);
        }

        match self.sessions.get(user) {
            Some(s) if s.token_matches(token) => Err(Error::UnexpectedInput {
                expected: s.phase.expects().to_string(),
            }),
            _ => Err(Error::SessionExpired),
        }
    }

    /// Snapshot of a user's state.
    pub fn get(&self, user: &str) -> Option<SessionState> {
        self.sessions.get(user).map(|s| s.clone())
    }

    pub fn phase(&self, user: &str) -> Phase {
        self.sessions
            .get(user)
            .map(|s| s.phase)
            .unwrap_or(Phase::Idle)
    }

    /// Drop a user's state unconditionally.
    pub fn clear(&self, user: &str) -> Option<SessionState> {
        self.sessions.remove(user).map(|(_, s)| s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_source() -> Source {
        Source::Url {
            address: "https://example.com/a.mp4".to_string(),
        }
    }

    #[test]
    fn test_choose_without_source_is_expired() {
        let store = SessionStore::new();
        let err = store.choose("u1", JobKind::Compress, None).unwrap_err();
        assert!(matches!(err, Error::SessionExpired));
    }

    #[test]
    fn test_round_trip_to_awaiting_and_execute() {
        let store = SessionStore::new();
        let (token, replaced) = store.begin("u1", url_source());
        assert!(replaced.is_none());
        assert_eq!(store.phase("u1"), Phase::ChoosingOperation);

        let choice = store.choose("u1", JobKind::Compress, Some(token.as_str())).unwrap();
        assert!(matches!(choice, Choice::Await(Phase::AwaitingCompressTarget)));

        let state = store
            .take("u1", Some(Phase::AwaitingCompressTarget), Some(token.as_str()))
            .unwrap();
        assert_eq!(state.operation, Some(JobKind::Compress));
        assert_eq!(store.phase("u1"), Phase::Idle);
    }

    #[test]
    fn test_immediate_operation_is_single_shot() {
        let store = SessionStore::new();
        let (token, _) = store.begin("u1", url_source());
        let choice = store.choose("u1", JobKind::MediaInfo, Some(token.as_str())).unwrap();
        assert!(matches!(choice, Choice::Execute(_)));

        let again = store.choose("u1", JobKind::MediaInfo, Some(token.as_str())).unwrap_err();
        assert!(matches!(again, Error::SessionExpired));
    }

    #[test]
    fn test_new_source_replaces_and_invalidates_old_token() {
        let store = SessionStore::new();
        let (old, _) = store.begin("u1", url_source());
        let (new, replaced) = store.begin(
            "u1",
            Source::Magnet {
                address: "magnet:?xt=urn:btih:abc".to_string(),
            },
        );
        assert!(replaced.is_some());
        assert_ne!(old, new);

        let err = store.choose("u1", JobKind::Compress, Some(old.as_str())).unwrap_err();
        assert!(matches!(err, Error::SessionExpired));
        assert!(store.choose("u1", JobKind::Compress, Some(new.as_str())).is_ok());
    }

    #[test]
    fn test_wrong_phase_input_keeps_state() {
        let store = SessionStore::new();
        let (token, _) = store.begin("u1", url_source());
        store.choose("u1", JobKind::SubtitleBurn, Some(token.as_str())).unwrap();

        let err = store
            .take("u1", Some(Phase::AwaitingResolution), None)
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedInput { .. }));
        assert_eq!(store.phase("u1"), Phase::AwaitingSubtitle);
    }

    #[test]
    fn test_manifest_download_lists_formats_first() {
        let store = SessionStore::new();
        let (token, _) = store.begin(
            "u1",
            Source::StreamManifest {
                address: "https://youtu.be/x".to_string(),
            },
        );
        let choice = store.choose("u1", JobKind::AcquireOnly, None).unwrap();
        assert!(matches!(choice, Choice::ListFormats { .. }));
        assert_eq!(store.phase("u1"), Phase::ChoosingOperation);

        store
            .offer_formats("u1", &token, vec![FormatOption::best()], None)
            .unwrap();
        let state = store.take("u1", Some(Phase::AwaitingFormat), Some(token.as_str())).unwrap();
        assert_eq!(state.scratch.formats.len(), 1);
    }

    #[test]
    fn test_clear_is_unconditional() {
        let store = SessionStore::new();
        assert!(store.clear("nobody").is_none());
        store.begin("u1", url_source());
        assert!(store.clear("u1").is_some());
        assert_eq!(store.phase("u1"), Phase::Idle);
    }

    #[test]
    fn test_users_are_independent() {
        let store = SessionStore::new();
        store.begin("u1", url_source());
        store.begin("u2", url_source());
        store.clear("u1");
        assert_eq!(store.phase("u2"), Phase::ChoosingOperation);
    }
}
