//! Processing notifications and the bus they are published on.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod notification;

pub use bus::{BusError, EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use in_memory_bus::InMemoryEventBus;
pub use notification::{
    NotificationEnvelope, NotificationStatus, ProcessingNotification, DETAIL_FAILURE,
    DETAIL_RECEIVED, DETAIL_SUCCESS, EVENT_SOURCE,
};
