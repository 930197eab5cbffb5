//! Collaborator Adapters
//!
//! Seams to the subsystems this crate drives but does not own: the credit
//! ledger, the meter registry, the event bus, the message display and the
//! host-protocol validators.
//!
//! Ledger and meter mutations take the caller's [`ScopedTransaction`] so they
//! become durable together with the transaction log update that justifies
//! them.
//!
//! [`ScopedTransaction`]: crate::storage::ScopedTransaction

pub mod display;
pub mod events;
pub mod ledger;
pub mod meters;
pub mod validator;

pub use display::{MessageDisplay, TracingMessageDisplay};
pub use events::{BroadcastEventBus, EventBus, TransferEvent, TransferPhase, WatEvent};
pub use ledger::{Ledger, LedgerError};
pub use meters::MeterRegistry;
pub use validator::{WatOffValidator, WatOnValidator};
