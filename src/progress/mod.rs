pub mod bus;
pub mod events;

pub use bus::{ProgressBus, ProgressSubscription, CHANNEL_CAPACITY, KEEPALIVE_INTERVAL};
pub use events::{ProgressEvent, ProgressPayload};
