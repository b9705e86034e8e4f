//! Delivery Pipeline (§4.9 / §4.10): the two consumer groups that drain the
//! durable log. The storage consumer turns `message_persistence_log` into
//! rows in the SQL archive; the push consumer turns `downlink_messages` into
//! best-effort WebSocket fan-out for recipients who were offline (or
//! unreachable) at send time.

pub mod message_store;
pub mod push_consumer;
pub mod storage_consumer;

pub use message_store::{SqlMessageStore, StoreError};
pub use push_consumer::PushConsumerHandler;
pub use storage_consumer::StorageConsumerHandler;
