pub mod messages;

pub use messages::{Inbound, Outbound, END_OF_UTTERANCE, MIC_PREFIX, SESSION_PREFIX, STREAM_PREFIX};
