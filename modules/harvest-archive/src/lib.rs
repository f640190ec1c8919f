pub mod archive;
mod codec;
pub mod error;
pub mod memory;
pub mod mirror;
pub mod postgres;
pub mod query;
pub mod store;

pub use archive::{Archive, ArchiveConfig, SweepStats};
pub use error::{ArchiveError, Result};
pub use memory::MemoryRecordStore;
pub use mirror::{to_miner_entity, MinerEntity, MirrorTarget, SqliteMinerMirror};
pub use postgres::PgRecordStore;
pub use query::{QueryExpr, Term};
pub use store::{RecordStore, StoredRecord};
