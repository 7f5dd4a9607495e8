//! Lokale Medien
//!
//! Streams, Capture-Geräte und die `MediaSource`, die den aktiven lokalen
//! Stream samt Mute- und Video-Flags verwaltet.

#[cfg(feature = "video-capture")]
mod camera;
mod devices;
pub(crate) mod microphone;
mod source;
mod stream;

#[cfg(feature = "video-capture")]
pub use camera::V4lCamera;
pub use devices::{CaptureDevices, MediaError, SystemDevices, VideoCapturer};
pub use source::MediaSource;
pub use stream::{CaptureGuard, MediaFrame, MediaStream, MediaTrack, SourceKind, TrackKind};
