pub mod export_snapshot;
pub mod ingest;
pub mod insights;
pub mod lead;
pub mod migrate;
pub mod normalize;
pub mod run;
pub mod score;
pub mod top_leads;
