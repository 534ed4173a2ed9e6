// Deduplicating content store with reference counting and per-owner quotas
//
// Identical bytes are stored once no matter how many owners upload them.
// Each upload becomes an OwnershipEntry pointing at a ContentRecord, and each
// owner is charged once per distinct content they hold.
pub mod db;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod gc;
pub mod ledger;
pub mod locks;
pub mod models;
pub mod storage;
pub mod vault;

pub use engine::{DedupEngine, ReclamationEngine, Removal};
pub use error::{CoreError, CoreResult};
pub use fingerprint::Fingerprint;
pub use gc::{SweepReport, VerifyReport};
pub use models::{
    ContentRecord, EntryMetadata, OwnershipEntry, QuotaRecord, UploadFile, Visibility,
};
pub use storage::{ContentStore, LocalContentStore, StoreConfig};
pub use vault::{OpenedContent, Vault};
