//! Local event bus used to correlate tokens with pending callbacks,
//! subscriptions and deferred results.

mod bus;

pub use bus::{EventBus, EventHandler, EventTarget, HandlerId, OnceHandler};
