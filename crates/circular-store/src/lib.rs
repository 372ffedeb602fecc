pub mod campaigns;
pub mod database;
pub mod error;
pub mod responses;
pub mod row_helpers;
pub mod schema;

pub use campaigns::CampaignRepo;
pub use database::Database;
pub use error::StoreError;
pub use responses::{LiveCounts, ResponseLedger};
