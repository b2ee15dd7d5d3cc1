//! Object orchestration tasks for Tencent Cloud Object Storage (COS).
//!
//! Two tasks are provided:
//!
//! * [`ConcatFileTask`] concatenates any number of source objects into one target object.  The
//!   sources are never downloaded in full; the target is uploaded from a stream that reads the
//!   sources' byte ranges one after another.
//! * [`DeleteFileTask`] deletes any number of objects by funneling individual deletes through a
//!   [`DeleteBatcher`], which coalesces them into bulk delete calls of up to 500 keys.
//!
//! Both tasks talk to storage through the traits in [`objstore`], so they run equally well
//! against COS ([`objstore::CosStorage`] and [`objstore::HttpRangeReader`]) or entirely in memory
//! ([`objstore::MemoryStorage`]).  Both report a [`TaskOutcome`] rather than failing.
//!
//! ```no_run
//! # async fn concat() -> costask::Result<()> {
//! use costask::{objstore::*, ConcatFileTask, ConcatParams, Config};
//!
//! let config = Config::default();
//! let storage = CosStorage::new(config.clone());
//! let reader = HttpRangeReader::new(&config);
//!
//! let mut task = ConcatFileTask::new(
//!     ConcatParams {
//!         source_list: vec![
//!             "https://b-1250000000.cos.ap-guangzhou.myqcloud.com/part1".parse().unwrap(),
//!             "https://b-1250000000.cos.ap-guangzhou.myqcloud.com/part2".parse().unwrap(),
//!         ],
//!         target: ObjectLocation::new("b-1250000000", "ap-guangzhou", "all"),
//!     },
//!     config,
//!     Box::new(storage.clone()),
//!     Box::new(reader),
//!     Box::new(storage),
//! );
//!
//! let outcome = task.run_task().await;
//! println!("{}", serde_json::to_string_pretty(&outcome).unwrap());
//! # Ok(())
//! # }
//! ```
mod concat;
mod config;
mod delete;
mod envelope;
mod error;
mod joiner;
pub mod objstore;
mod task_queue;
mod trigger;

pub use concat::{
    ConcatFileTask, ConcatLayout, ConcatParams, ConcatParamsSummary, RelatedPart, SourceItem,
};
pub use config::Config;
pub use delete::{DeleteBatcher, DeleteFileTask, DeleteParams, DeleteParamsSummary, DeleteResult};
pub use envelope::{error_chain, summarize, SummaryStatus, TaskOutcome, TaskSummary};
pub use error::{CosTaskError, Result};
pub use joiner::{join_streams, JoinedStream};
pub use task_queue::{TaskQueue, TaskQueueHandle, TaskTally};
pub use trigger::{TriggerEvent, TriggerType};
