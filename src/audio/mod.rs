pub mod analyzer;
pub mod backend;
pub mod clip;
pub mod endpoint;
pub mod file;
pub mod microphone;
pub mod pipeline;
pub mod resample;

pub use analyzer::{activity_level, AmplitudeAnalyzer};
pub use backend::{AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, AudioSource};
pub use clip::{ClipMetadata, UtteranceClip};
pub use endpoint::{EndpointConfig, EndpointDetector, EndpointEvent};
pub use file::{AudioFile, FileBackend};
pub use microphone::{list_input_devices, MicrophoneBackend};
pub use pipeline::{CapturePipeline, FrameOutcome};
pub use resample::{resample, StreamResampler};
