//! Mikrofon Capture
//!
//! Verwendet cpal für Cross-Platform Audio Input. Die Samples werden auf
//! 8 kHz Mono heruntergerechnet, als G.711 µ-law (PCMU) kodiert und in
//! 20ms-Frames in den Audio-Track geschrieben.

use super::devices::MediaError;
use super::stream::{CaptureGuard, MediaFrame, MediaTrack, TrackKind};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use ringbuf::{traits::*, HeapRb};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bevorzugte Capture-Rate des Geräts
const PREFERRED_DEVICE_RATE: u32 = 48000;

/// Sample Rate von PCMU
pub const SAMPLE_RATE: u32 = 8000;

/// Frame Size in Samples (20ms @ 8kHz = 160 samples)
pub const FRAME_SIZE: usize = 160;

/// Dauer eines Frames
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// µ-law Codewort für den Nullpegel
pub const ULAW_SILENCE: u8 = 0xFF;

/// Buffer Size für den Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// MICROPHONE
// ============================================================================

/// Öffnet das Standard-Mikrofon und liefert einen laufenden Audio-Track.
///
/// cpal-Streams sind nicht `Send`, deshalb lebt der Stream in einem eigenen
/// Thread, der beim Stoppen des Tracks beendet wird.
pub fn open() -> Result<MediaTrack, MediaError> {
    let track = MediaTrack::new(TrackKind::Audio, "microphone");

    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), MediaError>>(1);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let capture_track = track.clone();
    let handle = std::thread::Builder::new()
        .name("microphone-capture".to_string())
        .spawn(move || run_capture(capture_track, ready_tx, stop_rx))
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

    let guard = CaptureThread {
        stop_tx: Some(stop_tx),
        handle: Some(handle),
    };

    match ready_rx.recv() {
        Ok(Ok(())) => {
            track.attach_guard(Box::new(guard) as CaptureGuard);
            Ok(track)
        }
        Ok(Err(e)) => {
            drop(guard);
            track.stop();
            Err(e)
        }
        Err(_) => {
            drop(guard);
            track.stop();
            Err(MediaError::DeviceUnavailable(
                "Microphone capture thread exited".to_string(),
            ))
        }
    }
}

/// Hält den Capture-Thread am Leben, Drop beendet ihn
struct CaptureThread {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        // Sender droppen weckt den Thread auf
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_capture(
    track: MediaTrack,
    ready_tx: mpsc::SyncSender<Result<(), MediaError>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let stream = match build_stream(track) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Blockiert bis der Track gestoppt wird
    let _ = stop_rx.recv();
    drop(stream);
    tracing::info!("Microphone capture stopped");
}

fn build_stream(track: MediaTrack) -> Result<Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("No audio input device found".to_string()))?;

    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;
    let config = select_best_config(configs.collect())?;

    tracing::info!(
        "Starting microphone capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let source_rate = config.sample_rate.0;
    let channels = config.channels.max(1) as usize;
    let mut pending: HeapRb<f32> = HeapRb::new(RING_BUFFER_SIZE);

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                for sample in resample(&mono, source_rate, SAMPLE_RATE) {
                    let _ = pending.try_push(sample);
                }

                let enabled = track.is_enabled();
                while let Some(data) = next_frame(&mut pending, enabled) {
                    let frame = MediaFrame {
                        data,
                        duration: FRAME_DURATION,
                    };
                    if enabled {
                        track.push_frame(frame);
                    } else {
                        track.push_filler(frame);
                    }
                }
            },
            |err| {
                tracing::error!("Microphone capture error: {}", err);
            },
            None,
        )
        .map_err(map_build_error)
}

/// Nimmt einen vollen 20ms-Frame aus dem Puffer.
///
/// Ist der Track deaktiviert, wird statt des Signals Stille kodiert.
fn next_frame(pending: &mut HeapRb<f32>, enabled: bool) -> Option<Vec<u8>> {
    if pending.occupied_len() < FRAME_SIZE {
        return None;
    }
    let frame = (0..FRAME_SIZE)
        .filter_map(|_| pending.try_pop())
        .map(|sample| if enabled { encode_ulaw(sample) } else { ULAW_SILENCE })
        .collect();
    Some(frame)
}

fn map_build_error(err: cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::BackendSpecific { err }
            if err.description.to_lowercase().contains("permission") =>
        {
            MediaError::PermissionDenied(err.description)
        }
        other => MediaError::DeviceUnavailable(other.to_string()),
    }
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
    // Priorität: 48kHz F32 > beliebige F32 > erste verfügbare
    let target_rate = cpal::SampleRate(PREFERRED_DEVICE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.clone().with_max_sample_rate().into());
        }
    }

    if let Some(config) = configs.first() {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(MediaError::DeviceUnavailable(
        "No suitable audio configuration found".to_string(),
    ))
}

// ============================================================================
// SIGNAL HELPERS
// ============================================================================

/// Mittelt interleaved Kanäle zu Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches Linear-Resampling
fn resample(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// G.711 µ-law Kodierung eines Samples im Bereich -1.0..=1.0
pub fn encode_ulaw(sample: f32) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_reference_values() {
        assert_eq!(encode_ulaw(0.0), ULAW_SILENCE);
        assert_eq!(encode_ulaw(1.0), 0x80);
        assert_eq!(encode_ulaw(-1.0), 0x00);
        // Außerhalb des Bereichs wird geclippt
        assert_eq!(encode_ulaw(4.0), encode_ulaw(1.0));
    }

    #[test]
    fn test_ulaw_is_sign_symmetric() {
        for s in [0.01f32, 0.1, 0.5, 0.9] {
            assert_eq!(encode_ulaw(s) & 0x7F, encode_ulaw(-s) & 0x7F);
            assert_ne!(encode_ulaw(s) & 0x80, encode_ulaw(-s) & 0x80);
        }
    }

    #[test]
    fn test_resample_48k_to_8k() {
        let data = vec![0.5f32; 960];
        let out = resample(&data, 48000, SAMPLE_RATE);
        assert_eq!(out.len(), FRAME_SIZE);
        assert!(out.iter().all(|s| (s - 0.5).abs() < f32::EPSILON));
    }

    #[test]
    fn test_downmix_stereo() {
        let out = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn test_muted_frames_are_silence() {
        let mut pending: HeapRb<f32> = HeapRb::new(RING_BUFFER_SIZE);
        for _ in 0..FRAME_SIZE + 10 {
            let _ = pending.try_push(0.8);
        }

        let frame = next_frame(&mut pending, false).unwrap();
        assert_eq!(frame, vec![ULAW_SILENCE; FRAME_SIZE]);
        assert_eq!(pending.occupied_len(), 10);
        assert!(next_frame(&mut pending, false).is_none());
    }

    #[test]
    fn test_enabled_frames_carry_signal() {
        let mut pending: HeapRb<f32> = HeapRb::new(RING_BUFFER_SIZE);
        for _ in 0..FRAME_SIZE {
            let _ = pending.try_push(0.8);
        }
        let frame = next_frame(&mut pending, true).unwrap();
        assert!(frame.iter().all(|b| *b == encode_ulaw(0.8)));
        assert_ne!(frame[0], ULAW_SILENCE);
    }

    #[test]
    fn test_select_config_without_candidates() {
        assert!(matches!(
            select_best_config(Vec::new()),
            Err(MediaError::DeviceUnavailable(_))
        ));
    }
}
