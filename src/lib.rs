pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod transport;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFile, AudioFrame, AudioSource,
    CapturePipeline, EndpointConfig, EndpointDetector,
};
pub use config::Config;
pub use error::{VoiceError, VoiceResult};
pub use http::{create_router, AppState};
pub use playback::{AudioSink, CpalSink, PlaybackConfig, PlaybackScheduler};
pub use protocol::{Inbound, Outbound};
pub use session::{SendMode, SessionConfig, SessionEngine, SessionHandle, SessionSnapshot, SessionState};
pub use transport::{Connector, ReconnectPolicy, Transport, WebSocketConnector};
