//! Durable store-and-forward message store for the uplink connector.
//!
//! Outbound telemetry is buffered here until the remote peer acknowledges
//! delivery. The store survives process restarts, keeps a strict send order,
//! and bounds identifier growth by recycling the 32-bit id space when the
//! engine exhausts it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  store / publish / confirm  ┌──────────────────────┐
//! │   connector   │────────────────────────────▶│     MessageStore     │
//! │  (transport)  │◀────── next message ────────│  (schema, lifecycle) │
//! └───────────────┘                             └──────────┬───────────┘
//!                                                          │ with_connection
//!                                               ┌──────────▼───────────┐
//!                                               │ StorageEngineManager │
//!                                               │  (pool, locks,       │
//!                                               │   maintenance)       │
//!                                               └──────────────────────┘
//! ```
//!
//! ## Message lifecycle
//!
//! A record is Unpublished until handed to the transport, then InFlight
//! (confirmable) or Delivered (fire-and-forget). InFlight records become
//! Confirmed on acknowledgment, return to Unpublished on reconnect recovery,
//! or become Dropped when redelivery is abandoned. Confirmed and Dropped are
//! terminal and leave the store only through the age-bounded purge; InFlight
//! records are never purged by age.
//!
//! ## Example
//!
//! ```ignore
//! use uplink_message_store::{MessageStore, TransportToken};
//!
//! let store = MessageStore::open(engine, "outbound_messages").await?;
//!
//! let id = store.store("telemetry/device-7", Some(payload), 1, false, 4).await?;
//! let next = store.get_next_message().await?;
//! store.mark_as_published_with_token(id, &token).await?;
//! store.mark_as_confirmed(id).await?;
//! store.delete_stale_messages(purge_age).await?;
//! ```

mod message;
mod recycler;
mod sql;
mod store;

pub use message::{MessageState, StoredMessage, TransportToken};
pub use store::MessageStore;

pub use uplink_store_engine::{StoreError, StoreResult};
