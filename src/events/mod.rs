pub mod event;
pub mod notification;

pub use event::{wait_for_any, wait_for_event, Event, EventSignaller, WaitError};
pub use notification::{
    DeviceEvents, Notification, NotificationKind, NotifyFlags, NotifyHandle, RegisterableEvent,
};
