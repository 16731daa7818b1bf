//! The call session state machine.
//!
//! ```text
//! Idle -> OutgoingRinging -> Active <-> OnHold -> Ended -> Idle
//! Idle -> IncomingRinging -> Active | Idle
//! ```
//!
//! [`CallManager`] holds at most one [`CallSession`]. Its methods only
//! validate and record transitions; side effects on the transport and on
//! local tracks are handed back to the caller (a [`MediaOutcome`] or a
//! [`Teardown`]) so the owning actor performs them in one place.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use carelink_net::transport::{CallHandle, TransportError};
use carelink_shared::stream::MediaStream;
use carelink_shared::types::{CallId, PeerId};

use crate::devices::MediaError;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Another call is already in progress")]
    Busy,

    #[error("No call in progress")]
    NoSession,

    #[error("Cannot {op} while {state:?}")]
    InvalidState { op: &'static str, state: CallState },

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Active,
    OnHold,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// The single active or pending call.
#[derive(Debug)]
pub struct CallSession {
    generation: u64,
    remote: PeerId,
    direction: CallDirection,
    state: CallState,
    call: Option<CallHandle>,
    local_stream: Option<MediaStream>,
    remote_stream: Option<MediaStream>,
    pre_hold: Option<Vec<bool>>,
    muted: bool,
    awaiting_media: bool,
}

impl CallSession {
    fn new(generation: u64, remote: PeerId, direction: CallDirection, state: CallState) -> Self {
        Self {
            generation,
            remote,
            direction,
            state,
            call: None,
            local_stream: None,
            remote_stream: None,
            pre_hold: None,
            muted: false,
            awaiting_media: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&MediaStream> {
        self.remote_stream.as_ref()
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.call.as_ref().map(|c| c.id())
    }
}

/// What the caller must do with freshly acquired media.
#[derive(Debug)]
pub enum MediaOutcome {
    /// Place the outgoing call with this stream.
    Place { remote: PeerId, stream: MediaStream },
    /// Answer the pending incoming call with this stream.
    Answer { call: CallHandle, stream: MediaStream },
    /// The session this media was requested for is gone.
    Stale(MediaStream),
}

/// Result of an incoming call notification.
#[derive(Debug)]
pub enum IncomingOutcome {
    Ringing,
    /// A session already exists; the new call must be declined.
    Busy(CallHandle),
}

/// Resources released when a session ends.
#[derive(Debug)]
pub struct Teardown {
    pub remote: PeerId,
    pub previous: CallState,
    call: Option<CallHandle>,
    stream: Option<MediaStream>,
}

impl Teardown {
    /// Close the transport call and stop every local track. Returns the
    /// number of tracks stopped.
    pub fn release(self) -> usize {
        if let Some(call) = self.call {
            call.close();
        }
        let stopped = self.stream.map(|s| s.stop_all()).unwrap_or(0);
        debug!(peer = %self.remote.short(), stopped, "Call resources released");
        stopped
    }
}

/// UI-facing view of the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub remote: Option<PeerId>,
    pub direction: Option<CallDirection>,
    pub on_hold: bool,
    pub muted: bool,
    pub has_video: bool,
    pub has_remote_stream: bool,
}

/// Owner of the at-most-one call session.
#[derive(Debug, Default)]
pub struct CallManager {
    session: Option<CallSession>,
    next_generation: u64,
}

impl CallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Idle -> OutgoingRinging. Returns the generation media must be
    /// acquired for.
    pub fn begin_outgoing(&mut self, remote: PeerId) -> Result<u64, CallError> {
        if self.session.is_some() {
            return Err(CallError::Busy);
        }
        let generation = self.next_generation();
        let mut session = CallSession::new(
            generation,
            remote,
            CallDirection::Outgoing,
            CallState::OutgoingRinging,
        );
        session.awaiting_media = true;
        info!(peer = %session.remote.short(), generation, "Outgoing call ringing");
        self.session = Some(session);
        Ok(generation)
    }

    /// Idle -> IncomingRinging, or busy when a session exists.
    pub fn incoming(&mut self, call: CallHandle) -> IncomingOutcome {
        if let Some(existing) = &self.session {
            warn!(
                from = %call.remote().short(),
                current = %existing.remote.short(),
                "Incoming call while busy"
            );
            return IncomingOutcome::Busy(call);
        }
        let generation = self.next_generation();
        let mut session = CallSession::new(
            generation,
            call.remote().clone(),
            CallDirection::Incoming,
            CallState::IncomingRinging,
        );
        info!(from = %session.remote.short(), call = %call.id(), "Incoming call ringing");
        session.call = Some(call);
        self.session = Some(session);
        IncomingOutcome::Ringing
    }

    /// Start accepting the ringing incoming call. Returns the generation
    /// media must be acquired for.
    pub fn begin_accept(&mut self) -> Result<u64, CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoSession)?;
        if session.state != CallState::IncomingRinging || session.awaiting_media {
            return Err(CallError::InvalidState {
                op: "accept",
                state: session.state,
            });
        }
        session.awaiting_media = true;
        Ok(session.generation)
    }

    /// IncomingRinging -> Idle without touching media. Returns the
    /// resources to release.
    pub fn decline(&mut self) -> Result<Teardown, CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoSession)?;
        if session.state != CallState::IncomingRinging || session.awaiting_media {
            return Err(CallError::InvalidState {
                op: "decline",
                state: session.state,
            });
        }
        self.take_teardown().ok_or(CallError::NoSession)
    }

    /// Media acquisition for `generation` finished.
    pub fn media_ready(&mut self, generation: u64, stream: MediaStream) -> MediaOutcome {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.generation == generation && s.awaiting_media)
        else {
            debug!(generation, "Media arrived for a session that no longer exists");
            return MediaOutcome::Stale(stream);
        };

        session.awaiting_media = false;
        session.local_stream = Some(stream.clone());
        match session.direction {
            CallDirection::Outgoing => MediaOutcome::Place {
                remote: session.remote.clone(),
                stream,
            },
            CallDirection::Incoming => match session.call.clone() {
                Some(call) => MediaOutcome::Answer { call, stream },
                None => MediaOutcome::Stale(stream),
            },
        }
    }

    /// Media acquisition for `generation` failed; tear the session down if
    /// it is still current.
    pub fn media_failed(&mut self, generation: u64) -> Option<Teardown> {
        if self.session.as_ref()?.generation != generation {
            return None;
        }
        self.take_teardown()
    }

    /// Record the transport call placed for the outgoing session.
    pub fn attach_outgoing(&mut self, call: CallHandle) -> Result<(), CallHandle> {
        match self.session.as_mut() {
            Some(s) if s.direction == CallDirection::Outgoing && s.call.is_none() => {
                debug!(call = %call.id(), "Outgoing call placed");
                s.call = Some(call);
                Ok(())
            }
            _ => Err(call),
        }
    }

    /// The incoming call was answered: IncomingRinging -> Active.
    pub fn answered(&mut self) {
        if let Some(s) = self
            .session
            .as_mut()
            .filter(|s| s.state == CallState::IncomingRinging)
        {
            s.state = CallState::Active;
            info!(peer = %s.remote.short(), "Call active");
        }
    }

    /// The remote stream arrived on `call`. Returns `true` if it belonged
    /// to the current session.
    pub fn remote_stream(&mut self, call: CallId, stream: MediaStream) -> bool {
        let Some(s) = self
            .session
            .as_mut()
            .filter(|s| s.call_id() == Some(call))
        else {
            return false;
        };
        s.remote_stream = Some(stream);
        if s.state == CallState::OutgoingRinging {
            s.state = CallState::Active;
            info!(peer = %s.remote.short(), "Call active");
        }
        true
    }

    /// Active <-> OnHold by toggling every local track. Returns the new
    /// hold flag.
    pub fn toggle_hold(&mut self) -> Result<bool, CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoSession)?;
        let stream = match (&session.state, &session.local_stream) {
            (CallState::Active | CallState::OnHold, Some(stream)) => stream,
            (state, _) => {
                return Err(CallError::InvalidState {
                    op: "hold",
                    state: *state,
                })
            }
        };

        if session.state == CallState::Active {
            session.pre_hold = Some(stream.enabled_flags());
            for track in stream.tracks() {
                track.set_enabled(false);
            }
            session.state = CallState::OnHold;
        } else {
            let flags = session.pre_hold.take().unwrap_or_default();
            for (i, track) in stream.tracks().iter().enumerate() {
                track.set_enabled(flags.get(i).copied().unwrap_or(true));
            }
            session.state = CallState::Active;
        }

        let on_hold = session.state == CallState::OnHold;
        info!(on_hold, "Hold toggled");
        Ok(on_hold)
    }

    /// Flip the audio tracks on or off. Returns the new mute flag.
    pub fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoSession)?;
        let stream = match (&session.state, &session.local_stream) {
            (CallState::Active, Some(stream)) => stream,
            (state, _) => {
                return Err(CallError::InvalidState {
                    op: "mute",
                    state: *state,
                })
            }
        };
        session.muted = !session.muted;
        for track in stream.audio_tracks() {
            track.set_enabled(!session.muted);
        }
        info!(muted = session.muted, "Mute toggled");
        Ok(session.muted)
    }

    /// End whatever session exists. `None` when there was none.
    pub fn end(&mut self) -> Option<Teardown> {
        self.take_teardown()
    }

    /// End the session only if it owns `call` (remote close or error).
    pub fn end_if_call(&mut self, call: CallId) -> Option<Teardown> {
        if self.session.as_ref()?.call_id() != Some(call) {
            return None;
        }
        self.take_teardown()
    }

    fn take_teardown(&mut self) -> Option<Teardown> {
        let mut session = self.session.take()?;
        let previous = session.state;
        session.state = CallState::Ended;
        info!(peer = %session.remote.short(), ?previous, "Call ended");
        Some(Teardown {
            remote: session.remote,
            previous,
            call: session.call.take(),
            stream: session.local_stream.take(),
        })
    }

    pub fn snapshot(&self) -> CallSnapshot {
        match &self.session {
            None => CallSnapshot {
                state: CallState::Idle,
                remote: None,
                direction: None,
                on_hold: false,
                muted: false,
                has_video: false,
                has_remote_stream: false,
            },
            Some(s) => CallSnapshot {
                state: s.state,
                remote: Some(s.remote.clone()),
                direction: Some(s.direction),
                on_hold: s.state == CallState::OnHold,
                muted: s.muted,
                has_video: s.local_stream.as_ref().is_some_and(MediaStream::has_video),
                has_remote_stream: s.remote_stream.is_some(),
            },
        }
    }
}
