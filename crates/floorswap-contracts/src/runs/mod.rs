pub mod receipts;
pub mod remix;
pub mod summary;
