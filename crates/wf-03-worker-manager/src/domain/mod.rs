//! Pure rules of the worker manager.

pub mod confirmations;
pub mod transactions;

pub use confirmations::{ConfirmationTracker, PendingConfirmation};
pub use transactions::{
    build_transaction, call_data, check_source_status, parse_wei, ActionError, ActionParams,
};
