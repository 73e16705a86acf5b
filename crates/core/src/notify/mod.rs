//! Operation outcome notifications.

mod sinks;
mod types;
mod webhook;

pub use sinks::{FanoutNotificationSink, LogNotificationSink};
pub use types::*;
pub use webhook::WebhookNotificationSink;
