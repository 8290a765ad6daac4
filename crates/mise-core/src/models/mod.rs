pub mod job;
pub mod ladder;
pub mod migration;
pub mod rendition;
pub mod storage_object;
pub mod video;

pub use job::{JobProgress, JobState, TranscodeJob};
pub use ladder::{BitrateLadder, BitrateRung, MAX_LADDER_RUNGS};
pub use migration::{MigrationRecord, MigrationState, MigrationTally};
pub use rendition::{Rendition, RenditionSet};
pub use storage_object::{BackendId, BackendKind, ObjectKind, StorageObject};
pub use video::{RecipeVideo, VideoState};
