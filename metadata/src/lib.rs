mod error;
mod store;
mod types;

pub use error::MetadataError;
pub use store::{MetaStore, ReadTx, WriteTx};
pub use types::{Info, Kind, Snapshot, Usage};
