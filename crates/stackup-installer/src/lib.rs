mod component;
mod fs_utils;
mod layout;
mod lock;
mod process;
mod service;
mod state;
mod transactions;

pub use component::{ComponentInstaller, HealthStatus, ScriptInstaller};
pub use fs_utils::{remove_file_if_exists, sha256_file};
pub use layout::{default_state_root, StateLayout};
pub use lock::{process_alive, LockGuard, LockManager, LockRecord};
pub use service::{ServiceAction, ServiceManager, ServiceSnapshot, SystemdServices};
pub use state::{
    ComponentRecord, ComponentStatus, ComponentUpdate, RunScope, RunStatus, RunSummary,
    StateDocument, StateStore, DEFAULT_HISTORY_LIMIT,
};
pub use transactions::{
    FileOpKind, JournalEntry, JournalOp, RollbackContext, RollbackHook, RollbackReport,
    Transaction, TransactionManager, TransactionRecord, TransactionStatus,
};
