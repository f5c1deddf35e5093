use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// Pre-encoded chime played when tone synthesis is unavailable.
pub static FALLBACK_CLIP: &[u8] = include_bytes!("../assets/chime.wav");

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("audio unavailable: {0}")]
    Unavailable(String),

    #[error("audio context closed")]
    Closed,

    #[error("playback failed: {0}")]
    Playback(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    /// Created but not yet allowed to produce sound (e.g. before user interaction).
    Suspended,
    Closed,
}

/// One sine note, scheduled relative to the start of playback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency_hz: f32,
    pub start: Duration,
    pub duration: Duration,
    /// Peak amplitude in `0.0..=1.0`.
    pub gain: f32,
}

/// The two-note delivery chime.
pub const CHIME: [Tone; 2] = [
    Tone::new(880.0, Duration::from_millis(0), Duration::from_millis(150), 0.3),
    Tone::new(1320.0, Duration::from_millis(150), Duration::from_millis(200), 0.3),
];

impl Tone {
    pub const fn new(frequency_hz: f32, start: Duration, duration: Duration, gain: f32) -> Self {
        Self {
            frequency_hz,
            start,
            duration,
            gain,
        }
    }
}

/// A lazily created synthesis context that can be suspended or closed by
/// the host environment.
pub trait ToneContext: Send {
    fn state(&self) -> ContextState;
    fn resume(&mut self) -> Result<(), AudioError>;
    fn play(&mut self, tones: &[Tone]) -> Result<(), AudioError>;
}

/// Platform audio entry points used by the notifier.
pub trait AudioBackend: Send + Sync {
    fn open_tone_context(&self) -> Result<Box<dyn ToneContext>, AudioError>;
    fn play_clip(&self, clip: &[u8]) -> Result<(), AudioError>;
}

/// Backend for terminals: no synthesis, clips ring the bell.
pub struct TerminalBell {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TerminalBell {
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stderr()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }
}

impl Default for TerminalBell {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for TerminalBell {
    fn open_tone_context(&self) -> Result<Box<dyn ToneContext>, AudioError> {
        Err(AudioError::Unavailable("terminal has no tone synthesis".into()))
    }

    fn play_clip(&self, clip: &[u8]) -> Result<(), AudioError> {
        if clip.len() < 12 || &clip[0..4] != b"RIFF" || &clip[8..12] != b"WAVE" {
            return Err(AudioError::Playback("clip is not a WAV file".into()));
        }
        let mut out = self.out.lock().map_err(|_| AudioError::Unavailable("bell lock poisoned".into()))?;
        out.write_all(b"\x07")
            .and_then(|_| out.flush())
            .map_err(|e| AudioError::Playback(e.to_string()))
    }
}
