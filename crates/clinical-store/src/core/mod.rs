//! Core storage traits and abstractions.
//!
//! - [`ResourceStorage`] - CRUD
//! - [`ConditionalStorage`] - criteria-driven create/update/delete/patch
//! - [`VersionedStorage`] - vread and version-guarded writes
//! - history providers - instance and type history
//! - search providers - search, includes, chains
//! - [`Transaction`] and [`BundleProvider`] - atomic units and bundles
//!
//! ```text
//! ResourceStorage
//!     ├── ConditionalStorage
//!     ├── VersionedStorage
//!     │       └── InstanceHistoryProvider
//!     │               └── TypeHistoryProvider
//!     ├── SearchProvider
//!     │       ├── IncludeProvider
//!     │       ├── RevincludeProvider
//!     │       └── ChainedSearchProvider
//!     ├── TransactionProvider
//!     └── BundleProvider
//! ```

pub mod history;
pub mod search;
pub mod storage;
pub mod transaction;
pub mod versioned;

pub use history::{
    HistoryEntry, HistoryPage, HistoryParams, InstanceHistoryProvider, TypeHistoryProvider,
    history_bundle,
};
pub use search::{
    ChainedSearchProvider, IncludeProvider, RevincludeProvider, SearchProvider, SearchResult,
};
pub use storage::{
    ConditionalCreateResult, ConditionalDeleteResult, ConditionalPatchResult, ConditionalStorage,
    ConditionalUpdateResult, PatchFormat, ResourceStorage, apply_patch,
};
pub use transaction::{
    BundleEntry, BundleEntryResult, BundleMethod, BundleProvider, BundleResult, BundleType,
    Transaction, TransactionProvider, parse_bundle,
};
pub use versioned::{VersionedStorage, check_version_match, normalize_etag};
