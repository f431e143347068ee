pub(crate) mod filings;
pub(crate) mod health;
pub(crate) mod news;
pub(crate) mod research;
