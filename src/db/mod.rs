pub mod research_run_queries;
