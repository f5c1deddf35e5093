use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::audio::{AudioBackend, AudioError, CHIME, ContextState, FALLBACK_CLIP, ToneContext};
use crate::prefs::NotificationPrefs;

/// What a call to [`Notifier::notify`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Sound preference is off.
    Muted,
    /// Chime synthesised through the tone context.
    Tone,
    /// Tone path failed; the embedded clip was played instead.
    Clip,
    /// Both paths failed. Logged, never surfaced.
    Failed,
}

/// Plays the delivery cue.
///
/// The tone context is opened on first use and reused afterwards. Callers
/// are responsible for calling [`notify`](Self::notify) at most once per
/// delivery.
pub struct Notifier {
    backend: Arc<dyn AudioBackend>,
    prefs: Arc<NotificationPrefs>,
    context: Mutex<Option<Box<dyn ToneContext>>>,
}

impl Notifier {
    pub fn new(backend: Arc<dyn AudioBackend>, prefs: Arc<NotificationPrefs>) -> Self {
        Self {
            backend,
            prefs,
            context: Mutex::new(None),
        }
    }

    pub fn prefs(&self) -> &Arc<NotificationPrefs> {
        &self.prefs
    }

    pub fn notify(&self) -> NotifyOutcome {
        if !self.prefs.is_enabled() {
            debug!("delivery sound muted");
            return NotifyOutcome::Muted;
        }

        match self.play_tone() {
            Ok(()) => NotifyOutcome::Tone,
            Err(e) => {
                debug!("tone playback unavailable, falling back to clip: {e}");
                match self.backend.play_clip(FALLBACK_CLIP) {
                    Ok(()) => NotifyOutcome::Clip,
                    Err(e) => {
                        warn!("delivery sound failed: {e}");
                        NotifyOutcome::Failed
                    }
                }
            }
        }
    }

    fn play_tone(&self) -> Result<(), AudioError> {
        let mut slot = self
            .context
            .lock()
            .map_err(|_| AudioError::Unavailable("tone context lock poisoned".into()))?;

        let reopen = match slot.as_ref() {
            None => true,
            Some(ctx) => ctx.state() == ContextState::Closed,
        };
        if reopen {
            *slot = Some(self.backend.open_tone_context()?);
        }

        let ctx = slot.as_mut().ok_or(AudioError::Closed)?;
        if ctx.state() == ContextState::Suspended {
            ctx.resume()?;
        }
        ctx.play(&CHIME)
    }
}
