//! docq-core
//!
//! A priority message queue stored in a document collection.
//!
//! # Modules
//! - **domain**: value types (ids, priority, timestamps, messages, errors)
//! - **ports**: seams to the outside world (Collection, Clock, IdGenerator)
//! - **query**: payload filters -> stored document filters
//! - **index**: index planner for the claim and count queries
//! - **queue**: send / get / count / ack / ack_send / requeue
//! - **worker**: worker group driving a handler off the queue
//! - **impls**: in-memory Collection for tests and local runs
//! - **config**: JSON config with defaults

pub mod config;
pub mod domain;
pub mod impls;
pub mod index;
pub mod ports;
pub mod query;
pub mod queue;
pub mod worker;

pub use config::QueueConfig;
pub use domain::{Message, MessageId, Payload, Priority, QueueError, Timestamp};
pub use impls::MemoryCollection;
pub use queue::{GetOptions, Queue};
pub use worker::{MessageHandler, WorkerGroup, WorkerOptions};
