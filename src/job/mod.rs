//! Job lifecycle: state machine, job type, playlist serving, and the
//! manager that owns them.

pub mod job;
pub mod manager;
pub mod playlist;
pub mod state;

pub use job::{Job, JobKey, JobShape, VariantInfo};
pub use manager::{JobManager, SeekMode, PLAYLIST_READY_WAIT, SEEK_READY_WAIT};
pub use playlist::{rewrite_playlist, rewritten_playlist};
pub use state::{PlaybackState, StateCell, TransitionObserver};
