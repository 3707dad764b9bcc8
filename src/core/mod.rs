pub mod conn;
pub mod constants;
pub mod envelope;
pub mod socket;
pub mod user_data;
