pub mod api;
pub mod persister;
pub mod store;

pub use api::records_router;
pub use persister::{PersistOutcome, PersisterService, ResultPersister};
pub use store::{
    ImageRecord, MemoryRecordStore, NewImageRecord, PersistError, PgRecordStore, RecordStore,
};
