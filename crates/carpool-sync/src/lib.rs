//! Keeps client-side views of carpool rooms and chats consistent with the
//! backend while change events arrive duplicated, reordered, or ahead of the
//! rows they refer to.

pub mod conversation;
pub mod error;
pub mod fare;
pub mod listing;
pub mod ordered;
pub mod payment;
pub mod source;
pub mod validate;

#[cfg(test)]
mod testing;

pub use conversation::ConversationReconciler;
pub use error::{SyncError, SyncResult};
pub use fare::{Currency, format_currency, split_fare};
pub use listing::ListingReconciler;
pub use payment::{PaymentTarget, host_payment_targets, payment_targets};
pub use source::{
    Backend, ConnectionHandle, EventSink, EventSource, PointReader, RemoteMutations,
    SnapshotFetcher, Subscription,
};
