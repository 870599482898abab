//! Session boundary state machine.
//!
//! A session is a contiguous period of foreground activity. It is closed by
//! a terminate signal, or on the next foreground when the app stayed in the
//! background longer than the session timeout.

use crate::error::TrackingError;
use crate::lifecycle::LifecycleSignal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted session timestamps in epoch seconds. Zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_start_time: f64,
    pub session_end_time: f64,
}

/// Logical phase of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    Active,
    Backgrounded,
}

impl SessionPhase {
    fn from_state(state: &SessionState) -> Self {
        if state.session_start_time <= 0.0 {
            SessionPhase::NoSession
        } else if state.session_end_time > 0.0 {
            SessionPhase::Backgrounded
        } else {
            SessionPhase::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Start,
    End,
}

/// A session record to be queued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    /// Epoch seconds the event describes.
    pub timestamp: f64,
    /// Session length in seconds, set for `End` only.
    pub duration: Option<f64>,
}

impl SessionEvent {
    fn start(timestamp: f64) -> Self {
        Self {
            kind: SessionEventKind::Start,
            timestamp,
            duration: None,
        }
    }

    fn end(timestamp: f64, duration: f64) -> Self {
        Self {
            kind: SessionEventKind::End,
            timestamp,
            duration: Some(duration),
        }
    }
}

/// Destination for emitted session records.
pub trait SessionSink {
    fn append_session_event(&self, event: &SessionEvent) -> Result<(), TrackingError>;
}

/// Decides when `session_start` / `session_end` records are emitted.
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    phase: SessionPhase,
    timeout_secs: f64,
    persist_path: Option<PathBuf>,
}

impl SessionStateMachine {
    /// Create an in-memory state machine.
    pub fn new(timeout_secs: f64) -> Self {
        Self {
            state: SessionState::default(),
            phase: SessionPhase::NoSession,
            timeout_secs,
            persist_path: None,
        }
    }

    /// Create a state machine whose timestamps survive restarts.
    pub fn with_persistence(timeout_secs: f64, path: PathBuf) -> Self {
        let mut machine = Self::new(timeout_secs);
        machine.persist_path = Some(path);

        if let Err(e) = machine.load() {
            tracing::warn!(error = %e, "could not load previous session state");
        }
        machine.phase = SessionPhase::from_state(&machine.state);

        machine
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn timeout_secs(&self) -> f64 {
        self.timeout_secs
    }

    /// Apply a lifecycle signal at time `now` and return the records emitted.
    pub fn handle(
        &mut self,
        signal: LifecycleSignal,
        now: f64,
        sink: &dyn SessionSink,
    ) -> Vec<SessionEvent> {
        match signal {
            LifecycleSignal::ForegroundEntered => self.on_foreground(now, sink),
            LifecycleSignal::BackgroundEntered => {
                self.on_background(now);
                Vec::new()
            }
            LifecycleSignal::WillTerminate => self.on_terminate(now, sink),
        }
    }

    pub fn on_foreground(&mut self, now: f64, sink: &dyn SessionSink) -> Vec<SessionEvent> {
        if self.state.session_start_time <= 0.0 {
            // First session; its start is reported by install tracking.
            self.state = SessionState {
                session_start_time: now,
                session_end_time: 0.0,
            };
            self.phase = SessionPhase::Active;
            self.save();
            return Vec::new();
        }

        if !self.previous_session_expired(now) {
            self.phase = SessionPhase::Active;
            return Vec::new();
        }

        let start = self.state.session_start_time;
        let end = self.state.session_end_time;
        let end_event = SessionEvent::end(end, end - start);
        if let Err(e) = sink.append_session_event(&end_event) {
            tracing::warn!(error = %e, "failed to queue session end; keeping session open");
            return Vec::new();
        }

        let mut emitted = vec![end_event];
        self.state = SessionState {
            session_start_time: now,
            session_end_time: 0.0,
        };
        self.phase = SessionPhase::Active;
        self.save();

        let start_event = SessionEvent::start(now);
        match sink.append_session_event(&start_event) {
            Ok(()) => emitted.push(start_event),
            Err(e) => tracing::warn!(error = %e, "failed to queue session start"),
        }
        emitted
    }

    pub fn on_background(&mut self, now: f64) {
        if self.state.session_start_time <= 0.0 {
            tracing::debug!("background without an open session");
            return;
        }
        self.state.session_end_time = now;
        self.phase = SessionPhase::Backgrounded;
        self.save();
    }

    pub fn on_terminate(&mut self, now: f64, sink: &dyn SessionSink) -> Vec<SessionEvent> {
        self.close_session(now, sink).into_iter().collect()
    }

    /// Manually open a session, closing any open one first.
    pub fn start_session(&mut self, now: f64, sink: &dyn SessionSink) -> Vec<SessionEvent> {
        let mut emitted: Vec<SessionEvent> = Vec::new();
        if self.state.session_start_time > 0.0 {
            match self.close_session(now, sink) {
                Some(event) => emitted.push(event),
                None => return emitted,
            }
        }

        let start_event = SessionEvent::start(now);
        if let Err(e) = sink.append_session_event(&start_event) {
            tracing::warn!(error = %e, "failed to queue session start");
            return emitted;
        }
        self.state = SessionState {
            session_start_time: now,
            session_end_time: 0.0,
        };
        self.phase = SessionPhase::Active;
        self.save();
        emitted.push(start_event);
        emitted
    }

    /// Manually close the open session.
    pub fn end_session(&mut self, now: f64, sink: &dyn SessionSink) -> Vec<SessionEvent> {
        self.close_session(now, sink).into_iter().collect()
    }

    fn previous_session_expired(&self, now: f64) -> bool {
        self.state.session_start_time > 0.0
            && self.state.session_end_time > 0.0
            && now - self.state.session_end_time > self.timeout_secs
    }

    fn close_session(&mut self, now: f64, sink: &dyn SessionSink) -> Option<SessionEvent> {
        let start = self.state.session_start_time;
        if start <= 0.0 {
            self.phase = SessionPhase::NoSession;
            return None;
        }

        let end_event = SessionEvent::end(now, now - start);
        if let Err(e) = sink.append_session_event(&end_event) {
            tracing::warn!(error = %e, "failed to queue session end");
            return None;
        }

        self.state = SessionState::default();
        self.phase = SessionPhase::NoSession;
        self.save();
        Some(end_event)
    }

    fn save(&self) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&self.state).map_err(std::io::Error::other)?;
            std::fs::write(path, json)
        })();
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "could not persist session state");
        }
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                self.state = serde_json::from_str(&content).map_err(std::io::Error::other)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        events: RefCell<Vec<SessionEvent>>,
        fail: Cell<bool>,
    }

    impl SessionSink for RecordingSink {
        fn append_session_event(&self, event: &SessionEvent) -> Result<(), TrackingError> {
            if self.fail.get() {
                return Err(TrackingError::QueueUnavailable(
                    crate::error::QueueError::Poisoned,
                ));
            }
            self.events.borrow_mut().push(*event);
            Ok(())
        }
    }

    const TIMEOUT: f64 = 60.0;
    const T0: f64 = 1_700_000_000.0;

    #[test]
    fn test_first_foreground_starts_silently() {
        let sink = RecordingSink::default();
        let mut machine = SessionStateMachine::new(TIMEOUT);

        let emitted = machine.handle(LifecycleSignal::ForegroundEntered, T0, &sink);
        assert!(emitted.is_empty());
        assert_eq!(machine.state().session_start_time, T0);
        assert_eq!(machine.phase(), SessionPhase::Active);
    }

    #[test]
    fn test_timeout_exceeded_closes_previous_session() {
        let sink = RecordingSink::default();
        let mut machine = SessionStateMachine::new(TIMEOUT);

        machine.handle(LifecycleSignal::ForegroundEntered, T0, &sink);
        machine.handle(LifecycleSignal::BackgroundEntered, T0 + 10.0, &sink);
        assert_eq!(machine.phase(), SessionPhase::Backgrounded);

        let resume = T0 + 10.0 + TIMEOUT + 1.0;
        let emitted = machine.handle(LifecycleSignal::ForegroundEntered, resume, &sink);

        let ends: Vec<_> = emitted
            .iter()
            .filter(|e| e.kind == SessionEventKind::End)
            .collect();
        assert_eq!(ends.len(), 1);
        assert!((ends[0].duration.unwrap() - 10.0).abs() < 1e-9);
        assert_eq!(ends[0].timestamp, T0 + 10.0);
        assert_eq!(emitted.last().unwrap().kind, SessionEventKind::Start);

        assert_eq!(machine.state().session_start_time, resume);
        assert_eq!(machine.state().session_end_time, 0.0);
        assert_eq!(machine.phase(), SessionPhase::Active);
    }

    #[test]
    fn test_within_timeout_keeps_session() {
        let sink = RecordingSink::default();
        let mut machine = SessionStateMachine::new(TIMEOUT);

        machine.handle(LifecycleSignal::ForegroundEntered, T0, &sink);
        machine.handle(LifecycleSignal::BackgroundEntered, T0 + 10.0, &sink);
        let emitted = machine.handle(
            LifecycleSignal::ForegroundEntered,
            T0 + 10.0 + TIMEOUT - 1.0,
            &sink,
        );

        assert!(emitted.is_empty());
        assert!(sink.events.borrow().is_empty());
        assert_eq!(machine.state().session_start_time, T0);
        assert_eq!(machine.phase(), SessionPhase::Active);
    }

    #[test]
    fn test_terminate_emits_end_and_resets() {
        let sink = RecordingSink::default();
        let mut machine = SessionStateMachine::new(TIMEOUT);

        machine.handle(LifecycleSignal::ForegroundEntered, T0, &sink);
        let emitted = machine.handle(LifecycleSignal::WillTerminate, T0 + 42.5, &sink);

        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, SessionEventKind::End);
        assert!((emitted[0].duration.unwrap() - 42.5).abs() < 1e-9);
        assert_eq!(machine.state(), SessionState::default());
        assert_eq!(machine.phase(), SessionPhase::NoSession);
    }

    #[test]
    fn test_terminate_without_session_is_silent() {
        let sink = RecordingSink::default();
        let mut machine = SessionStateMachine::new(TIMEOUT);
        assert!(machine
            .handle(LifecycleSignal::WillTerminate, T0, &sink)
            .is_empty());
    }

    #[test]
    fn test_append_failure_leaves_timestamps_untouched() {
        let sink = RecordingSink::default();
        let mut machine = SessionStateMachine::new(TIMEOUT);

        machine.handle(LifecycleSignal::ForegroundEntered, T0, &sink);
        machine.handle(LifecycleSignal::BackgroundEntered, T0 + 10.0, &sink);
        let before = machine.state();

        sink.fail.set(true);
        let emitted = machine.handle(
            LifecycleSignal::ForegroundEntered,
            T0 + 10.0 + TIMEOUT + 5.0,
            &sink,
        );
        assert!(emitted.is_empty());
        assert_eq!(machine.state(), before);

        let emitted = machine.handle(LifecycleSignal::WillTerminate, T0 + 500.0, &sink);
        assert!(emitted.is_empty());
        assert_eq!(machine.state(), before);
    }

    #[test]
    fn test_end_time_implies_backgrounded() {
        let sink = RecordingSink::default();
        let mut machine = SessionStateMachine::new(TIMEOUT);

        // Background before any session does not set an end time.
        machine.handle(LifecycleSignal::BackgroundEntered, T0, &sink);
        assert_eq!(machine.state().session_end_time, 0.0);
        assert_eq!(machine.phase(), SessionPhase::NoSession);
    }

    #[test]
    fn test_manual_session_control() {
        let sink = RecordingSink::default();
        let mut machine = SessionStateMachine::new(TIMEOUT);

        let emitted = machine.start_session(T0, &sink);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, SessionEventKind::Start);

        let emitted = machine.start_session(T0 + 30.0, &sink);
        let kinds: Vec<_> = emitted.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![SessionEventKind::End, SessionEventKind::Start]);

        let emitted = machine.end_session(T0 + 45.0, &sink);
        assert!((emitted[0].duration.unwrap() - 15.0).abs() < 1e-9);
        assert_eq!(machine.phase(), SessionPhase::NoSession);
    }

    #[test]
    fn test_state_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("session.json");
        let sink = RecordingSink::default();

        {
            let mut machine = SessionStateMachine::with_persistence(TIMEOUT, path.clone());
            machine.handle(LifecycleSignal::ForegroundEntered, T0, &sink);
            machine.handle(LifecycleSignal::BackgroundEntered, T0 + 10.0, &sink);
        }

        let mut machine = SessionStateMachine::with_persistence(TIMEOUT, path);
        assert_eq!(machine.phase(), SessionPhase::Backgrounded);
        assert_eq!(machine.state().session_start_time, T0);

        let emitted = machine.handle(LifecycleSignal::ForegroundEntered, T0 + 1000.0, &sink);
        assert_eq!(emitted[0].kind, SessionEventKind::End);
    }
}
