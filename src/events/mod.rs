//! Real-time job and server events.

pub mod bus;
pub mod frame;

pub use bus::{EventBus, GlobalSubscription};
pub use frame::{Frame, GlobalEvent, JobEvent, STATUS_EVENT};
