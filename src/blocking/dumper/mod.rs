#[doc(hidden)]
pub mod oplog_helper;
#[doc(hidden)]
pub mod snapshot;
mod dumper;
mod sink;
mod tailer;
mod time_helper;

pub use dumper::MongoDumper;
