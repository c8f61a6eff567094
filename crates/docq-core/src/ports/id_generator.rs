//! IdGenerator port - message id generation.
//!
//! # Implementations
//! - **UlidGenerator**: ULID stamped with the injected clock's time

use ulid::Ulid;

use crate::domain::MessageId;
use crate::ports::Clock;

/// Generates ids for new messages.
///
/// `Send + Sync` so a single generator can be shared by every producer.
pub trait IdGenerator: Send + Sync {
    fn generate_message_id(&self) -> MessageId;
}

/// ULID based generator.
///
/// The timestamp half of the ULID comes from the clock, so a `FixedClock`
/// yields ids sharing one timestamp while the random half keeps them unique.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_message_id(&self) -> MessageId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        MessageId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
