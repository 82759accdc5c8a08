mod aggregate;
mod checkpoint;
mod event;
mod notification;

pub use aggregate::{DailyAggregate, UserAggregate};
pub use checkpoint::Checkpoint;
pub use event::{EventId, EventKind, EventPayload, RawEvent};
pub use notification::{Notification, NotificationKind};
