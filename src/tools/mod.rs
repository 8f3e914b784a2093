//! 能力层：检索、结构化分析、推理，以及按工具名分派步骤的 ToolDispatcher

pub mod analysis;
pub mod cache;
pub mod executor;
pub mod kind;
pub mod retrieval;

pub use analysis::{AnalysisClient, HttpAnalysisClient, MockAnalysisClient, ToolParam, ToolSpec};
pub use cache::{CachedCatalog, TimedCache};
pub use executor::ToolDispatcher;
pub use kind::{AnalysisTool, ToolKind};
pub use retrieval::{HttpRetrievalClient, RetrievalClient, RetrievalQuery};
