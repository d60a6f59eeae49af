/// provide mongo backup blocking apis.
mod connection;
#[doc(hidden)]
pub mod dumper;
#[doc(hidden)]
pub mod restorer;

pub use connection::Connection;
pub use dumper::MongoDumper;
pub use restorer::{MongoRestorer, RestoreStats};
