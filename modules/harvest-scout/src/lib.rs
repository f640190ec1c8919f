pub mod fetch;
pub mod pool;
pub mod retention;
pub mod scheduler;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use fetch::{FetchError, FetchExecutor, FetchResult, FetchSpec, HttpFetcher, RecordFilter, SourceFetcher};
pub use pool::{
    EgressIdentity, Health, Lease, PoolConfig, PoolError, PoolSnapshot, ReleaseOutcome, ResourcePool,
    SourceAccount,
};
pub use retention::RetentionSweeper;
pub use scheduler::{BatchRun, CollectionScheduler, RunTotals, SchedulerConfig};
