//! Kamera Capture (V4L2)
//!
//! Liest YUYV-Frames über mmap-Streaming, rechnet sie nach I420 um und
//! kodiert sie mit openh264 als H.264 (Annex B). Ist der Video-Track
//! deaktiviert, wird ein Schwarzbild kodiert.

use super::devices::{MediaError, VideoCapturer};
use super::stream::{CaptureGuard, MediaFrame, MediaTrack};
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVSource;
use openh264::OpenH264API;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// Ziel-Bitrate des Encoders
const BITRATE_BPS: u32 = 500_000;

/// Luma/Chroma eines schwarzen Pixels (BT.601, begrenzter Bereich)
const BLACK_LUMA: u8 = 16;
const NEUTRAL_CHROMA: u8 = 128;

/// Eine V4L2-Kamera
#[derive(Debug, Clone)]
pub struct V4lCamera {
    device: String,
    width: u32,
    height: u32,
    fps: u32,
}

impl V4lCamera {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            width: 640,
            height: 480,
            fps: 15,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32, fps: u32) -> Self {
        self.width = width;
        self.height = height;
        self.fps = fps.max(1);
        self
    }
}

impl VideoCapturer for V4lCamera {
    fn start(&self, track: &MediaTrack) -> Result<CaptureGuard, MediaError> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), MediaError>>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let settings = self.clone();
        let capture_track = track.clone();
        let capture_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || run_capture(settings, capture_track, ready_tx, capture_stop))
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        let guard = CameraThread {
            stop,
            handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(guard)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MediaError::DeviceUnavailable(
                "Camera capture thread exited".to_string(),
            )),
        }
    }
}

/// Hält den Capture-Thread am Leben, Drop beendet ihn
struct CameraThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for CameraThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Öffnet das Gerät und setzt YUYV in der gewünschten Auflösung
fn open_device(settings: &V4lCamera) -> Result<(Device, u32, u32), MediaError> {
    let dev = Device::with_path(&settings.device).map_err(|e| map_open_error(&settings.device, e))?;

    let mut fmt = dev
        .format()
        .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;
    fmt.width = settings.width;
    fmt.height = settings.height;
    fmt.fourcc = FourCC::new(b"YUYV");
    let actual = dev
        .set_format(&fmt)
        .map_err(|e| MediaError::DeviceUnavailable(format!("YUYV not supported: {}", e)))?;

    if actual.fourcc != FourCC::new(b"YUYV") {
        return Err(MediaError::DeviceUnavailable(format!(
            "Camera delivers {} instead of YUYV",
            actual.fourcc
        )));
    }

    if let Ok(mut params) = dev.params() {
        params.interval = v4l::Fraction::new(1, settings.fps);
        let _ = dev.set_params(&params);
    }

    tracing::info!(
        "Camera opened: {} {}x{} @ {}fps",
        settings.device,
        actual.width,
        actual.height,
        settings.fps
    );
    Ok((dev, actual.width, actual.height))
}

fn map_open_error(path: &str, err: std::io::Error) -> MediaError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => MediaError::PermissionDenied(path.to_string()),
        _ => MediaError::DeviceUnavailable(format!("{}: {}", path, err)),
    }
}

fn run_capture(
    settings: V4lCamera,
    track: MediaTrack,
    ready_tx: mpsc::SyncSender<Result<(), MediaError>>,
    stop: Arc<AtomicBool>,
) {
    let opened = open_device(&settings).and_then(|(dev, width, height)| {
        let config = EncoderConfig::new(width, height)
            .max_frame_rate(settings.fps as f32)
            .set_bitrate_bps(BITRATE_BPS);
        let encoder = Encoder::with_config(OpenH264API::from_source(), config)
            .map_err(|e| MediaError::DeviceUnavailable(format!("H.264 encoder: {}", e)))?;
        Ok((dev, width, height, encoder))
    });
    let (dev, width, height, mut encoder) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut stream = match Stream::with_buffers(&dev, Type::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(e.to_string())));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let duration = Duration::from_secs(1) / settings.fps;
    let black = black_i420(width as usize, height as usize);

    while !stop.load(Ordering::SeqCst) && !track.is_stopped() {
        let buf = match stream.next() {
            Ok((buf, _)) => buf,
            Err(e) => {
                tracing::error!("Camera read failed: {}", e);
                break;
            }
        };

        let enabled = track.is_enabled();
        let i420 = if enabled {
            yuyv_to_i420(buf, width as usize, height as usize)
        } else {
            black.clone()
        };
        let yuv = I420 {
            data: &i420,
            width: width as usize,
            height: height as usize,
        };

        let data = match encoder.encode(&yuv) {
            Ok(bitstream) => {
                let mut annexb = Vec::new();
                for layer in (0..bitstream.num_layers()).filter_map(|i| bitstream.layer(i)) {
                    for nal in (0..layer.nal_count()).filter_map(|i| layer.nal_unit(i)) {
                        annexb.extend_from_slice(nal);
                    }
                }
                annexb
            }
            Err(e) => {
                tracing::warn!("H.264 encode failed: {}", e);
                continue;
            }
        };
        if data.is_empty() {
            continue;
        }

        let frame = MediaFrame { data, duration };
        if enabled {
            track.push_frame(frame);
        } else {
            track.push_filler(frame);
        }
    }
    tracing::info!("Camera capture stopped");
}

// ============================================================================
// YUV
// ============================================================================

/// Planares I420-Bild für den Encoder
struct I420<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
}

impl I420<'_> {
    fn chroma_len(&self) -> usize {
        (self.width / 2) * (self.height / 2)
    }
}

impl YUVSource for I420<'_> {
    fn width(&self) -> i32 {
        self.width as i32
    }
    fn height(&self) -> i32 {
        self.height as i32
    }
    fn y(&self) -> &[u8] {
        &self.data[..self.width * self.height]
    }
    fn u(&self) -> &[u8] {
        let start = self.width * self.height;
        &self.data[start..start + self.chroma_len()]
    }
    fn v(&self) -> &[u8] {
        let start = self.width * self.height + self.chroma_len();
        &self.data[start..start + self.chroma_len()]
    }
    fn y_stride(&self) -> i32 {
        self.width as i32
    }
    fn u_stride(&self) -> i32 {
        (self.width / 2) as i32
    }
    fn v_stride(&self) -> i32 {
        (self.width / 2) as i32
    }
}

/// YUYV (4:2:2 packed) nach I420 (4:2:0 planar).
///
/// Chroma wird aus den geraden Zeilen übernommen. Zu kurze Puffer (z.B.
/// abgeschnittene Frames) lassen den Rest schwarz.
fn yuyv_to_i420(yuyv: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = black_i420(width, height);
    let chroma_width = width / 2;
    let (luma, chroma) = out.split_at_mut(width * height);
    let (u_plane, v_plane) = chroma.split_at_mut(chroma_width * (height / 2));

    for (row, line) in yuyv.chunks_exact(width * 2).take(height).enumerate() {
        for (pair, px) in line.chunks_exact(4).enumerate() {
            luma[row * width + pair * 2] = px[0];
            luma[row * width + pair * 2 + 1] = px[2];
            if row % 2 == 0 && row / 2 < height / 2 {
                u_plane[(row / 2) * chroma_width + pair] = px[1];
                v_plane[(row / 2) * chroma_width + pair] = px[3];
            }
        }
    }
    out
}

fn black_i420(width: usize, height: usize) -> Vec<u8> {
    let luma = width * height;
    let chroma = (width / 2) * (height / 2);
    let mut out = vec![BLACK_LUMA; luma + chroma * 2];
    out[luma..].fill(NEUTRAL_CHROMA);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_i420_planes() {
        // 4x2: zwei Zeilen mit je zwei Pixelpaaren
        let yuyv = [
            10, 100, 11, 200, 12, 101, 13, 201, //
            20, 110, 21, 210, 22, 111, 23, 211,
        ];
        let out = yuyv_to_i420(&yuyv, 4, 2);

        assert_eq!(&out[..8], &[10, 11, 12, 13, 20, 21, 22, 23]);
        assert_eq!(&out[8..10], &[100, 101]);
        assert_eq!(&out[10..12], &[200, 201]);
    }

    #[test]
    fn test_truncated_frame_stays_black() {
        let out = yuyv_to_i420(&[50, 60, 51, 70, 52, 61, 53, 71, 99], 4, 2);
        assert_eq!(&out[..4], &[50, 51, 52, 53]);
        assert!(out[4..8].iter().all(|y| *y == BLACK_LUMA));
        assert_eq!(&out[8..12], &[60, 61, 70, 71]);
    }

    #[test]
    fn test_black_frame() {
        let out = black_i420(4, 4);
        assert_eq!(out.len(), 24);
        assert!(out[..16].iter().all(|y| *y == BLACK_LUMA));
        assert!(out[16..].iter().all(|c| *c == NEUTRAL_CHROMA));
    }
}
