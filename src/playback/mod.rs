pub mod decode;
pub mod output;
pub mod scheduler;

pub use decode::{decode_payload, PlaybackBuffer, PlaybackConfig};
pub use output::{
    completion_channel, AudioSink, CompletionReceiver, CompletionSender, CpalSink, EntryId,
    ScheduledEntry,
};
pub use scheduler::{PlaybackQueue, PlaybackScheduler, PlaybackStats, PlaybackStatus};
