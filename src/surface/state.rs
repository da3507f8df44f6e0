// Serializable snapshot migrated between hosting contexts.

use serde::{Deserialize, Serialize};

/// Observable playback settings of a surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub current_time_seconds: f64,
    pub paused: bool,
    pub muted: bool,
    pub volume: f64,
    pub playback_rate: f64,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            current_time_seconds: 0.0,
            paused: true,
            muted: false,
            volume: 1.0,
            playback_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoState {
    pub src: String,
    #[serde(flatten)]
    pub playback: PlaybackState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Pure UI state that travels with the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UiState {
    pub minimized: bool,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceState {
    pub auto_advance: bool,
    pub minimized: bool,
    pub position: Option<Position>,
    pub video: Option<VideoState>,
}

impl SurfaceState {
    pub fn ui(&self) -> UiState {
        UiState {
            minimized: self.minimized,
            position: self.position,
        }
    }

    /// Whether importing this state can skip the initial media load.
    pub fn has_source(&self) -> bool {
        self.video.as_ref().is_some_and(|v| !v.src.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let state = SurfaceState {
            auto_advance: true,
            minimized: false,
            position: Some(Position { x: 12.0, y: 30.0 }),
            video: Some(VideoState {
                src: "http://cdn/a.mp4".into(),
                playback: PlaybackState {
                    current_time_seconds: 42.5,
                    paused: false,
                    muted: true,
                    volume: 0.8,
                    playback_rate: 1.25,
                },
            }),
        };

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["autoAdvance"], true);
        assert_eq!(value["video"]["src"], "http://cdn/a.mp4");
        assert_eq!(value["video"]["currentTimeSeconds"], 42.5);
        assert_eq!(value["video"]["playbackRate"], 1.25);

        let back: SurfaceState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_has_source() {
        let mut state = SurfaceState {
            auto_advance: true,
            minimized: false,
            position: None,
            video: None,
        };
        assert!(!state.has_source());
        state.video = Some(VideoState {
            src: String::new(),
            playback: PlaybackState::default(),
        });
        assert!(!state.has_source());
        state.video.as_mut().unwrap().src = "http://x".into();
        assert!(state.has_source());
    }
}
