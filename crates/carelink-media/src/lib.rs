//! Local media acquisition and the call session state machine.

pub mod devices;
pub mod session;

pub use devices::{acquire_with_fallback, MediaConstraints, MediaDevices, MediaError, SyntheticDevices};
pub use session::{
    CallDirection, CallError, CallManager, CallSession, CallSnapshot, CallState, IncomingOutcome,
    MediaOutcome, Teardown,
};
