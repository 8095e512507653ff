//! PostgreSQL-backed message broker.
//!
//! Producers call [`Broker::enqueue`]; the row is written in state `queued`
//! and a deferred trigger sends `NOTIFY` on
//! `{prefix}.tasks.{queue}.enqueue` when the transaction commits. Workers
//! [`subscribe`](Broker::subscribe) to those channels and claim rows from the
//! task store.
//!
//! ```rust,ignore
//! use pgtask::broker::{Broker, EnqueueRequest};
//!
//! let broker = Broker::new(pool, "pgtask");
//! let id = broker
//!     .enqueue_request(
//!         EnqueueRequest::new("default", "echo")
//!             .with_args(br#"["hi"]"#.to_vec())
//!             .with_delay(std::time::Duration::from_secs(10)),
//!     )
//!     .await?;
//! let result = broker.fetch_result(id).await?;
//! ```

pub mod channel;
mod client;
pub mod message;
pub mod subscription;

pub use channel::{channel_name, lock_key, scheduler_lock_key, ChannelIdentifier};
pub use client::{Broker, EnqueueRequest};
pub use message::{Message, MessageError};
pub use subscription::{Subscription, Wake};
