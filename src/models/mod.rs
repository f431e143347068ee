pub mod news;
pub mod pipeline;
pub mod research;
pub mod research_run;
pub mod sec_filing;

pub use news::{NewsQueryParams, NewsSearchResponse};
pub use pipeline::{PipelineRun, ResearchReport, ResearchRequest, RunState, Termination};
pub use research::{CompanyProfile, ImpactScore, RankedTopic, RetrievedDocument, Topic, Urgency};
pub use research_run::{ResearchRunSummary, RunListParams};
pub use sec_filing::{FilingContent, FilingContentParams, FilingSearchParams, FilingType, SecFiling};
