pub mod config;
pub mod dom;
pub mod element;
pub mod error;
pub mod extractor;
pub mod gallery;
pub mod grouper;
pub mod images;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod reviews;
pub mod section;
pub mod store;
pub mod summary;
pub mod task;
pub mod text;
pub mod traits;
pub mod util;
pub mod validator;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use config::{TaskConfig, Tunables};
pub use dom::DomSnapshot;
pub use error::AppError;
pub use metrics::MetricsTracker;
pub use models::{AssetCategory, ResultEnvelope, compute_hash};
pub use orchestrator::{Orchestrator, TaskOutcome};
pub use store::ContentStore;
pub use summary::ResultSummary;
pub use task::{TaskRecord, TaskState, TaskStatus, TaskUpdate};
pub use traits::{
    FetchedImage, ImageSource, LiveElement, NullTaskStore, PageSource, PageSourceProvider,
    ReportSink, TaskStore,
};
