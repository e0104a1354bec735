//! Canonical PCM frame definition and mixing arithmetic (C1), plus the
//! capture/playback trait boundary that stands in for the out-of-scope
//! device-discovery layer, with a `cpal`-backed default implementation.
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{VoxError, VoxResult};

/// Canonical call sample rate.
pub const SAMPLE_RATE_HZ: u32 = 16_000;
/// Samples per 10 ms call frame.
pub const SAMPLES_PER_FRAME: usize = 160;
/// Bytes per call frame: 160 samples * 2 bytes (i16 LE).
pub const FRAME_BYTES: usize = SAMPLES_PER_FRAME * 2;

/// One 320-byte slice of 16 kHz mono signed 16-bit little-endian PCM.
///
/// Any read shorter than `FRAME_BYTES` is discarded by callers; this type
/// only ever holds a full frame.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AudioFrame(pub [u8; FRAME_BYTES]);

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AudioFrame({} bytes)", FRAME_BYTES)
    }
}

impl AudioFrame {
    /// The zero frame (digital silence).
    pub fn silence() -> Self {
        Self([0u8; FRAME_BYTES])
    }

    /// Build a frame from exactly `FRAME_BYTES` of raw PCM. Shorter reads
    /// are rejected, matching the capture pipeline's discard policy.
    pub fn from_exact(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != FRAME_BYTES {
            return None;
        }
        let mut buf = [0u8; FRAME_BYTES];
        buf.copy_from_slice(bytes);
        Some(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_BYTES] {
        &self.0
    }

    fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.0
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
    }
}

/// Mix N simultaneous frames into one by per-sample arithmetic mean scaled
/// by a 0.7 headroom factor, saturating to i16 range.
pub fn mix(frames: &[AudioFrame]) -> AudioFrame {
    if frames.is_empty() {
        return AudioFrame::silence();
    }
    let n = frames.len() as f64;
    let mut out = [0u8; FRAME_BYTES];
    let mut iters: Vec<_> = frames.iter().map(|f| f.samples()).collect();
    for i in 0..SAMPLES_PER_FRAME {
        let mut acc = 0f64;
        for it in iters.iter_mut() {
            if let Some(s) = it.next() {
                acc += s as f64;
            }
        }
        let mixed = (acc / n) * 0.7;
        let clamped = mixed.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        let bytes = clamped.to_le_bytes();
        out[i * 2] = bytes[0];
        out[i * 2 + 1] = bytes[1];
    }
    AudioFrame(out)
}

/// A source of outbound PCM frames (capture device stand-in).
pub trait CaptureSource: Send {
    /// Read one capture iteration. `None` means "skip this tick" (zero or
    /// fewer bytes read).
    fn read_frame(&mut self) -> Option<AudioFrame>;
}

/// A sink for inbound PCM frames (playback device stand-in).
pub trait PlaybackSink: Send {
    fn write_frame(&mut self, frame: &AudioFrame);
}

/// Enumerate available input and output devices.
pub fn list_devices() -> VoxResult<(Vec<Device>, Vec<Device>)> {
    let host = cpal::default_host();
    let inputs: Vec<_> = host
        .input_devices()
        .map_err(|e| VoxError::MediaHardwareFailure(e.to_string()))?
        .collect();
    let outputs: Vec<_> = host
        .output_devices()
        .map_err(|e| VoxError::MediaHardwareFailure(e.to_string()))?
        .collect();
    Ok((inputs, outputs))
}

pub fn device_name(dev: &Device) -> String {
    dev.name().unwrap_or_else(|_| "<unknown>".into())
}

/// `CaptureSource` backed by the host's default input device via `cpal`.
/// The device's native callback thread pushes frames through a bounded
/// channel; `read_frame` blocks up to a short tick interval.
pub struct CpalCapture {
    rx: Receiver<AudioFrame>,
    _stream: cpal::Stream,
    running: Arc<AtomicBool>,
}

impl CpalCapture {
    pub fn open(dev: &Device) -> VoxResult<Self> {
        let cfg = dev
            .default_input_config()
            .map_err(|e| VoxError::MediaHardwareFailure(e.to_string()))?;
        let sample_format = cfg.sample_format();
        let config: StreamConfig = cfg.into();
        let (tx, rx): (Sender<AudioFrame>, Receiver<AudioFrame>) =
            crossbeam_channel::bounded(64);
        let running = Arc::new(AtomicBool::new(true));
        let stream = build_capture_stream(dev, &config, sample_format, tx, running.clone())
            .map_err(|e| VoxError::MediaHardwareFailure(e.to_string()))?;
        stream
            .play()
            .map_err(|e| VoxError::MediaHardwareFailure(e.to_string()))?;
        info!(rate = SAMPLE_RATE_HZ, "capture stream started");
        Ok(Self {
            rx,
            _stream: stream,
            running,
        })
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl CaptureSource for CpalCapture {
    fn read_frame(&mut self) -> Option<AudioFrame> {
        self.rx
            .recv_timeout(std::time::Duration::from_millis(20))
            .ok()
    }
}

fn build_capture_stream(
    dev: &Device,
    config: &StreamConfig,
    fmt: SampleFormat,
    tx: Sender<AudioFrame>,
    running: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    // Re-chunk raw capture callbacks into exact FRAME_BYTES slices and
    // discard any remainder shorter than one frame.
    let mut carry: Vec<u8> = Vec::with_capacity(FRAME_BYTES * 2);
    let err_fn = |e| error!(error = %e, "capture stream error");
    match fmt {
        SampleFormat::I16 => dev.build_input_stream(
            config,
            move |data: &[i16], _| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let raw: &[u8] = unsafe {
                    std::slice::from_raw_parts(data.as_ptr() as *const u8, data.len() * 2)
                };
                carry.extend_from_slice(raw);
                while carry.len() >= FRAME_BYTES {
                    let frame_bytes: Vec<u8> = carry.drain(0..FRAME_BYTES).collect();
                    if let Some(frame) = AudioFrame::from_exact(&frame_bytes) {
                        let _ = tx.try_send(frame);
                    }
                }
            },
            err_fn,
            None,
        ),
        other => {
            warn!(?other, "unsupported input sample format, dropping capture");
            dev.build_input_stream(config, move |_data: &[i16], _| {}, err_fn, None)
        }
    }
}

/// `PlaybackSink` backed by the host's default output device via `cpal`.
pub struct CpalPlayback {
    tx: Sender<AudioFrame>,
    _stream: cpal::Stream,
}

impl CpalPlayback {
    pub fn open(dev: &Device) -> VoxResult<Self> {
        let cfg = dev
            .default_output_config()
            .map_err(|e| VoxError::MediaHardwareFailure(e.to_string()))?;
        let sample_format = cfg.sample_format();
        let config: StreamConfig = cfg.into();
        let (tx, rx): (Sender<AudioFrame>, Receiver<AudioFrame>) =
            crossbeam_channel::bounded(64);
        let stream = build_playback_stream(dev, &config, sample_format, rx)
            .map_err(|e| VoxError::MediaHardwareFailure(e.to_string()))?;
        stream
            .play()
            .map_err(|e| VoxError::MediaHardwareFailure(e.to_string()))?;
        info!("playback stream started");
        Ok(Self {
            tx,
            _stream: stream,
        })
    }
}

impl PlaybackSink for CpalPlayback {
    fn write_frame(&mut self, frame: &AudioFrame) {
        let _ = self.tx.try_send(*frame);
    }
}

fn build_playback_stream(
    dev: &Device,
    config: &StreamConfig,
    fmt: SampleFormat,
    rx: Receiver<AudioFrame>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let mut leftover: Vec<i16> = Vec::new();
    let err_fn = |e| error!(error = %e, "playback stream error");
    match fmt {
        SampleFormat::I16 => dev.build_output_stream(
            config,
            move |out: &mut [i16], _| {
                let mut produced = 0usize;
                while produced < out.len() {
                    if leftover.is_empty() {
                        match rx.try_recv() {
                            Ok(frame) => leftover.extend(frame.samples()),
                            Err(_) => break,
                        }
                    }
                    let take = leftover.len().min(out.len() - produced);
                    out[produced..produced + take].copy_from_slice(&leftover[..take]);
                    leftover.drain(0..take);
                    produced += take;
                }
                for s in &mut out[produced..] {
                    *s = 0;
                }
            },
            err_fn,
            None,
        ),
        other => {
            warn!(?other, "unsupported output sample format, playing silence");
            dev.build_output_stream(config, move |out: &mut [i16], _| out.fill(0), err_fn, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tone(value: i16) -> AudioFrame {
        let mut buf = [0u8; FRAME_BYTES];
        for chunk in buf.chunks_exact_mut(2) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        AudioFrame(buf)
    }

    #[test]
    fn silence_is_zero_frame() {
        let s = AudioFrame::silence();
        assert!(s.samples().all(|v| v == 0));
    }

    #[test]
    fn from_exact_rejects_short_reads() {
        assert!(AudioFrame::from_exact(&[0u8; FRAME_BYTES - 1]).is_none());
        assert!(AudioFrame::from_exact(&[0u8; FRAME_BYTES]).is_some());
    }

    #[test]
    fn mix_of_two_max_frames_saturates_in_range() {
        let a = tone(i16::MAX);
        let b = tone(i16::MAX);
        let mixed = mix(&[a, b]);
        for s in mixed.samples() {
            assert!(s >= i16::MIN && s <= i16::MAX);
        }
        // mean(MAX, MAX) * 0.7 stays well under MAX, no clamping needed here.
        assert_eq!(
            mixed.samples().next().unwrap(),
            ((i16::MAX as f64) * 0.7).round() as i16
        );
    }

    #[test]
    fn mix_of_extreme_opposite_frames_saturates() {
        let a = tone(i16::MIN);
        let b = tone(i16::MIN);
        let mixed = mix(&[a, b]);
        for s in mixed.samples() {
            assert!(s >= i16::MIN && s <= i16::MAX);
        }
    }

    #[test]
    fn mix_empty_is_silence() {
        let mixed = mix(&[]);
        assert_eq!(mixed, AudioFrame::silence());
    }
}
