//! Core dispatch primitives for courier.
//!
//! This crate owns sessions, subscribers, their bounded event queues, and the
//! dispatcher that routes events to them. All cross-node state goes through a
//! [`courier_rs_store::SharedStore`], so any node can deliver to a session whose
//! client connection is held by another node.

mod aging;
mod context;
pub mod dispatcher;
pub mod error;
pub mod ids;
mod keys;
pub mod manager;
pub mod queue;
pub mod session;
pub mod subscriber;
pub mod subscription;

pub use dispatcher::Dispatcher;
pub use error::CourierError;
pub use manager::{SessionManager, SessionVisit, VisitReport};
/// Queue primitives and storage backends.
pub use queue::{EventQueue, MaxWait, MemoryQueueStorage, QueueStorage, StoreQueueStorage};
pub use session::Session;
pub use subscriber::{FetchOutcome, Subscriber};
pub use subscription::Subscription;
