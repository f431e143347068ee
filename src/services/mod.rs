pub mod impact_ranking_service;
pub mod llm_service;
pub mod news_service;
pub mod query_generator_service;
pub mod research_service;
pub mod sec_edgar_service;
pub mod topic_service;
