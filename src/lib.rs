pub mod cli;
pub mod common;
pub mod convert;
pub mod garmin_client;
pub mod peloton_client;
pub mod sync;
pub mod upload_history;
