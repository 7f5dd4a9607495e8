//! Anruf-Sessions
//!
//! `CallSession` ist der Zustandsautomat eines einzelnen Anrufs,
//! `SessionController` die Steuerung darüber.

mod call;
mod controller;

pub use call::{CallSession, CallState, CloseReason, Direction, SessionError, SessionId};
pub use controller::{
    Command, ControllerError, ControllerEvent, ControllerState, SessionController, REJECT_BUSY,
    REJECT_FAILED, REJECT_MEDIA_UNAVAILABLE,
};
