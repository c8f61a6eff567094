//! Ports - seams to the outside world.
//!
//! The queue itself holds no state. It talks to a document collection, reads
//! the time and mints ids through the traits below, so the same protocol runs
//! against any store that offers single-document atomic updates.

pub mod clock;
pub mod collection;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::collection::{
    Collection, Direction, Document, FindOneAndUpdateOptions, IndexModel, KeyPattern,
    ReturnDocument, StoreError, Update, UpdateResult,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
