//! Per-job playback state machine.
//!
//! The happy path is monotonic: Starting → Buffering → Playing →
//! Completed. Seeking regresses a live job and re-enters Buffering; every
//! such re-entry bumps the job generation so callbacks fired by stale
//! in-flight work can recognize they are no longer authoritative.

use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Playback lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Starting,
    Buffering,
    Playing,
    Paused,
    Seeking,
    Completed,
    Error,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Starting => "starting",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Seeking => "seeking",
            PlaybackState::Completed => "completed",
            PlaybackState::Error => "error",
        };
        write!(f, "{name}")
    }
}

impl PlaybackState {
    /// Whether the machine may move from `self` to `to`.
    pub fn can_transition_to(self, to: PlaybackState) -> bool {
        use PlaybackState::*;
        if self == to {
            return false;
        }
        match (self, to) {
            (_, Error) => !matches!(self, Completed),
            (Starting, Buffering) => true,
            (Buffering, Playing) => true,
            (Buffering, Seeking) => true,
            (Playing, Paused | Completed | Seeking) => true,
            (Paused, Playing | Seeking) => true,
            (Seeking, Buffering) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PlaybackState::Completed | PlaybackState::Error)
    }
}

/// Observer invoked on every accepted transition with
/// `(from, to, generation)`.
pub type TransitionObserver = Box<dyn Fn(PlaybackState, PlaybackState, u64) + Send + Sync>;

struct StateInner {
    state: PlaybackState,
    generation: u64,
    observers: Vec<TransitionObserver>,
}

impl StateInner {
    /// Apply one transition: legality check, generation bump on the
    /// Seeking re-entry, observer delivery.
    fn apply(&mut self, to: PlaybackState) -> bool {
        let from = self.state;
        if !from.can_transition_to(to) {
            trace!(state_op = "rejected_transition", from = %from, to = %to);
            return false;
        }
        self.state = to;
        // Re-entering the pipeline after a seek invalidates in-flight work.
        if from == PlaybackState::Seeking && matches!(to, PlaybackState::Buffering) {
            self.generation += 1;
        }
        let generation = self.generation;
        debug!(state_op = "transition", from = %from, to = %to, generation);
        for observer in &self.observers {
            observer(from, to, generation);
        }
        true
    }
}

/// Lock-guarded state cell owned by a job.
pub struct StateCell {
    inner: Mutex<StateInner>,
}

impl StateCell {
    pub fn new(initial: PlaybackState) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                state: initial,
                generation: 0,
                observers: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> PlaybackState {
        self.inner.lock().unwrap().state
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    /// Register an observer. Callers do this at job creation time.
    pub fn observe(&self, observer: TransitionObserver) {
        self.inner.lock().unwrap().observers.push(observer);
    }

    /// Attempt a transition, delivering observer callbacks on success.
    pub fn transition(&self, to: PlaybackState) -> bool {
        self.transition_if_generation(to, None)
    }

    /// Attempt a transition on behalf of work started at `generation`.
    /// Stale generations are rejected: they belong to a superseded
    /// transcoder run.
    pub fn transition_from_generation(&self, to: PlaybackState, generation: u64) -> bool {
        self.transition_if_generation(to, Some(generation))
    }

    fn transition_if_generation(&self, to: PlaybackState, generation: Option<u64>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(generation) = generation {
            if generation < inner.generation {
                trace!(
                    state_op = "stale_transition",
                    to = %to,
                    stale_generation = generation,
                    current_generation = inner.generation,
                );
                return false;
            }
        }
        inner.apply(to)
    }

    /// Drive Buffering then Playing in one critical section on behalf of
    /// work started at `generation` (the first-playlist sighting). One
    /// staleness check covers both hops, so a supersede cannot slip in
    /// between them.
    pub fn advance_to_playing(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if generation < inner.generation {
            trace!(
                state_op = "stale_transition",
                to = "playing",
                stale_generation = generation,
                current_generation = inner.generation,
            );
            return false;
        }
        if inner.state.can_transition_to(PlaybackState::Buffering) {
            inner.apply(PlaybackState::Buffering);
        }
        if inner.state == PlaybackState::Playing {
            return true;
        }
        inner.apply(PlaybackState::Playing)
    }

    /// Bump the generation for a same-directory re-init (auto-restart or
    /// seek replacement of this job).
    pub fn bump_generation(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.generation += 1;
        inner.generation
    }
}
