pub mod datastore;

pub use datastore::TcpDatastore;
