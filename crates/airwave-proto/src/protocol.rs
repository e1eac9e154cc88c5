use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Lower and upper bound of an equalizer band gain, in dB.
pub const BAND_GAIN_MIN_DB: f32 = -12.0;
pub const BAND_GAIN_MAX_DB: f32 = 12.0;

/// Messages sent from a UI client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Select a station.  Selecting the active station toggles play/pause.
    SelectStation { station_idx: usize },
    TogglePlay,
    Reload,
    Volume { value: f32 },
    ToggleMute,
    SetBand { band: Band, db: f32 },
    SetEqualizer { enabled: bool },
    GetState,
}

/// Messages sent from the daemon to UI clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        rev: u64,
        state: SessionState,
    },
    State {
        data: SessionState,
    },
    NowPlaying {
        text: Option<String>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Playback status of the selected station, as shown to the listener.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle, // nothing selected yet
    Loading, // buffering; the UI shows a spinner
    Playing,
    Paused,
    Failed, // load/play/attach failed; only re-selecting recovers
}

impl PlaybackStatus {
    /// Short label for badges / status lines.
    pub fn label(&self) -> &'static str {
        match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Loading => "loading",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
            PlaybackStatus::Failed => "failed",
        }
    }
}

/// One of the three fixed equalizer bands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Low,
    Mid,
    High,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::Low, Band::Mid, Band::High];

}

impl std::str::FromStr for Band {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "bass" => Ok(Band::Low),
            "mid" | "middle" => Ok(Band::Mid),
            "high" | "treble" => Ok(Band::High),
            other => anyhow::bail!("unknown equalizer band '{}'", other),
        }
    }
}

/// Clamp a requested band gain into the supported range.
pub fn clamp_band_gain(db: f32) -> f32 {
    if db.is_nan() {
        return 0.0;
    }
    db.clamp(BAND_GAIN_MIN_DB, BAND_GAIN_MAX_DB)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EqualizerState {
    pub enabled: bool,
    pub low_db: f32,
    pub mid_db: f32,
    pub high_db: f32,
}

impl Default for EqualizerState {
    fn default() -> Self {
        Self {
            enabled: true,
            low_db: 0.0,
            mid_db: 0.0,
            high_db: 0.0,
        }
    }
}

impl EqualizerState {
    pub fn gain(&self, band: Band) -> f32 {
        match band {
            Band::Low => self.low_db,
            Band::Mid => self.mid_db,
            Band::High => self.high_db,
        }
    }

    pub fn set_gain(&mut self, band: Band, db: f32) {
        let db = clamp_band_gain(db);
        match band {
            Band::Low => self.low_db = db,
            Band::Mid => self.mid_db = db,
            Band::High => self.high_db = db,
        }
    }
}

/// Observable playback session.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Monotonic revision counter, incremented on every state change.
    #[serde(default)]
    pub rev: u64,
    pub stations: Vec<Station>,
    pub active_station: Option<usize>,
    pub active_station_name: Option<String>,
    pub status: PlaybackStatus,
    /// Optimistically true from the moment a station is selected.
    pub is_playing: bool,
    pub is_loading: bool,
    pub volume: f32,
    pub muted: bool,
    pub now_playing: Option<String>,
    /// Human-readable reason for the last `Failed` transition.
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub equalizer: EqualizerState,
    /// True once every station has been handed to the preloader.
    #[serde(default)]
    pub preloaded: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            rev: 0,
            stations: Vec::new(),
            active_station: None,
            active_station_name: None,
            status: PlaybackStatus::Idle,
            is_playing: false,
            is_loading: false,
            volume: 1.0,
            muted: false,
            now_playing: None,
            last_error: None,
            equalizer: EqualizerState::default(),
            preloaded: false,
        }
    }
}

/// A named, fixed streaming URL.  Identity is the URL.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Station {
    pub name: String,
    pub url: String,
}

impl Station {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// More bytes are needed; keep the buffer and read again.
    #[error("incomplete frame")]
    Incomplete,
    /// The length header is over `MAX_FRAME_BYTES`.  The stream cannot be
    /// resynchronised after this.
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_BYTES)]
    TooLarge(usize),
    /// A complete frame whose body is not a valid message.  `consumed` bytes
    /// can be skipped to reach the next frame.
    #[error("malformed frame: {source}")]
    Malformed {
        consumed: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < 4 {
            return Err(FrameError::Incomplete);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(len));
        }
        if data.len() < 4 + len {
            return Err(FrameError::Incomplete);
        }
        match serde_json::from_slice(&data[4..4 + len]) {
            Ok(msg) => Ok((msg, 4 + len)),
            Err(source) => Err(FrameError::Malformed {
                consumed: 4 + len,
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encode_decode() {
        let msg = Message::Command(Command::SetBand {
            band: Band::Mid,
            db: -4.5,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::SetBand { band, db }) => {
                assert_eq!(band, Band::Mid);
                assert_eq!(db, -4.5);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_hello_encode_decode() {
        let state = SessionState {
            rev: 42,
            now_playing: Some("Artist - Title".to_string()),
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(rev, 42);
                assert_eq!(state.now_playing.as_deref(), Some("Artist - Title"));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let encoded = Message::Command(Command::TogglePlay).encode().unwrap();
        assert!(matches!(
            Message::decode(&encoded[..3]),
            Err(FrameError::Incomplete)
        ));
        assert!(matches!(
            Message::decode(&encoded[..encoded.len() - 1]),
            Err(FrameError::Incomplete)
        ));
    }

    #[test]
    fn test_malformed_frame_can_be_skipped() {
        let mut data = 5u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"{bad}");
        let valid = Message::Command(Command::TogglePlay).encode().unwrap();
        data.extend_from_slice(&valid);

        let consumed = match Message::decode(&data) {
            Err(FrameError::Malformed { consumed, .. }) => consumed,
            other => panic!("expected malformed frame, got {:?}", other),
        };
        assert_eq!(consumed, 9);
        let (msg, len) = Message::decode(&data[consumed..]).unwrap();
        assert_eq!(len, valid.len());
        assert!(matches!(msg, Message::Command(Command::TogglePlay)));
    }

    #[test]
    fn test_oversized_frame_is_rejected_before_buffering() {
        let header = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes();
        assert!(matches!(
            Message::decode(&header),
            Err(FrameError::TooLarge(n)) if n == MAX_FRAME_BYTES + 1
        ));
    }

    #[test]
    fn test_band_parsing_and_clamp() {
        assert_eq!("LOW".parse::<Band>().unwrap(), Band::Low);
        assert_eq!("treble".parse::<Band>().unwrap(), Band::High);
        assert!("sub".parse::<Band>().is_err());

        let mut eq = EqualizerState::default();
        eq.set_gain(Band::High, 30.0);
        eq.set_gain(Band::Low, -30.0);
        assert_eq!(eq.gain(Band::High), BAND_GAIN_MAX_DB);
        assert_eq!(eq.gain(Band::Low), BAND_GAIN_MIN_DB);
        assert_eq!(clamp_band_gain(f32::NAN), 0.0);
    }
}
