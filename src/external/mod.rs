pub mod search_provider;
pub mod tavily;
