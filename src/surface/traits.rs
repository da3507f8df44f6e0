use tokio::sync::broadcast;

use super::state::PlaybackState;

/// Events a surface reports about its bound source.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    /// Enough data to start playing.
    Ready,
    /// The source failed to load or decode.
    Error(String),
    /// Non-fatal trouble (stall, slow network). Never treated as failure.
    Warning(String),
    /// Playback reached the end of the item.
    Ended,
    Playing,
    Paused,
}

/// The UI element that displays one media item at a time.
///
/// This is the whole capability the engine relies on; rendering is the host's business.
pub trait Surface: Send + Sync {
    /// Point the surface at a new source. Outcomes arrive as events.
    fn bind(&self, source: &str);

    /// Drop the current source and stop playback.
    fn unbind(&self);

    fn subscribe(&self) -> broadcast::Receiver<SurfaceEvent>;

    fn playback_state(&self) -> PlaybackState;

    fn apply_playback_state(&self, state: &PlaybackState);

    /// Seconds of media buffered ahead of the playhead.
    fn buffered_ahead_secs(&self) -> f64;

    fn play(&self);

    fn pause(&self);

    fn is_playing(&self) -> bool {
        !self.playback_state().paused
    }
}
