//! Reliable delivery: outbox → transport → inbox.
//!
//! Producers append to the outbox in the same unit of work as their
//! business state; the [`OutboxRelay`] polls Pending rows into the
//! transport; the [`InboxDispatcher`] dedups and locks on the consumer
//! side. The idempotency store and dead-letter queue round out the
//! reliability primitives.

pub mod dispatcher;
pub mod dlq;
pub mod idempotency;
pub mod inbox;
pub mod outbox;
pub mod relay;

pub use dispatcher::{InboxDispatcher, InboxHandler};
pub use dlq::{DeadLetterQueue, DlqEntry, InMemoryDlq};
pub use idempotency::{IdempotencyStore, IdempotencyStoreExt, ShardedIdempotencyStore};
pub use inbox::{InMemoryInbox, InboxMessage, InboxStatus, InboxStore};
pub use outbox::{InMemoryOutbox, OutboxMessage, OutboxStatus, OutboxStore};
pub use relay::{OutboxRelay, OutboxRelayConfig};
