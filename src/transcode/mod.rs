//! FFmpeg integration: argument assembly, progress parsing, and process
//! supervision.

pub mod args;
pub mod driver;
pub mod progress;

pub use args::{
    build_args, choose_mode, playlist_path, variant_ladder, EncodingMode, SubtitleBurn,
    TranscodeSpec,
};
pub use driver::{run_transcoder, DriverParams, TranscoderOutcome};
pub use progress::{Progress, ProgressStream};
