#[doc(hidden)]
pub mod loader;
#[doc(hidden)]
pub mod replayer;
mod restorer;

pub use replayer::OplogReplayer;
pub use restorer::{MongoRestorer, RestoreStats};
