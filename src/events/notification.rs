//! Hardware notification registration.

use bitflags::bitflags;

use super::event::Event;
use crate::capture::settings::TransferMode;
use crate::driver::ChannelHandle;
use crate::error::Result;

bitflags! {
    /// Notification classes the driver can raise an event for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NotifyFlags: u64 {
        const SIGNAL_CHANGE = 0x0020;
        const FRAME_BUFFERING = 0x0100;
        const FRAME_BUFFERED = 0x0400;
    }
}

/// Opaque handle returned by a notify or timer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifyHandle(pub u64);

/// A registration with the driver, used to query per-notification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub handle: NotifyHandle,
    pub channel: ChannelHandle,
}

impl Notification {
    pub fn new(handle: NotifyHandle, channel: ChannelHandle) -> Self {
        Self { handle, channel }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    SignalChange,
    FrameBuffered,
    FrameBuffering,
    /// Registered through the driver's timer call rather than the generic notify call.
    Timer,
}

impl NotificationKind {
    pub fn registration_token(self) -> Option<NotifyFlags> {
        match self {
            NotificationKind::SignalChange => Some(NotifyFlags::SIGNAL_CHANGE),
            NotificationKind::FrameBuffered => Some(NotifyFlags::FRAME_BUFFERED),
            NotificationKind::FrameBuffering => Some(NotifyFlags::FRAME_BUFFERING),
            NotificationKind::Timer => None,
        }
    }
}

/// An event that can be bound to one hardware notification. The first registration wins.
#[derive(Debug)]
pub struct RegisterableEvent {
    kind: NotificationKind,
    event: Event,
    notification: Option<Notification>,
}

impl RegisterableEvent {
    pub fn new(kind: NotificationKind, event: Event) -> Self {
        Self {
            kind,
            event,
            notification: None,
        }
    }

    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    pub fn registration_token(&self) -> Option<NotifyFlags> {
        self.kind.registration_token()
    }

    /// Records the registration; ignored if already registered.
    pub fn register(&mut self, notification: Notification) {
        if self.notification.is_none() {
            self.notification = Some(notification);
        }
    }

    pub fn is_registered(&self) -> bool {
        self.notification.is_some()
    }

    pub fn notification(&self) -> Option<Notification> {
        self.notification
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn destroy(&mut self) {
        self.event.destroy();
    }
}

/// Every event a device session owns.
#[derive(Debug)]
pub struct DeviceEvents {
    pub transfer_complete: Event,
    pub signal_change: RegisterableEvent,
    pub frame_buffered: RegisterableEvent,
    pub frame_buffering: RegisterableEvent,
    pub timer: RegisterableEvent,
}

impl DeviceEvents {
    pub fn new(mut create: impl FnMut() -> Result<Event>) -> Result<Self> {
        Ok(Self {
            transfer_complete: create()?,
            signal_change: RegisterableEvent::new(NotificationKind::SignalChange, create()?),
            frame_buffered: RegisterableEvent::new(NotificationKind::FrameBuffered, create()?),
            frame_buffering: RegisterableEvent::new(NotificationKind::FrameBuffering, create()?),
            timer: RegisterableEvent::new(NotificationKind::Timer, create()?),
        })
    }

    /// The event whose firing starts a transfer in `mode`.
    pub fn grab_event(&self, mode: TransferMode) -> &RegisterableEvent {
        match mode {
            TransferMode::Timer => &self.timer,
            TransferMode::Normal => &self.frame_buffered,
            TransferMode::LowLatency => &self.frame_buffering,
        }
    }

    pub fn get(&self, kind: NotificationKind) -> &RegisterableEvent {
        match kind {
            NotificationKind::SignalChange => &self.signal_change,
            NotificationKind::FrameBuffered => &self.frame_buffered,
            NotificationKind::FrameBuffering => &self.frame_buffering,
            NotificationKind::Timer => &self.timer,
        }
    }

    pub fn get_mut(&mut self, kind: NotificationKind) -> &mut RegisterableEvent {
        match kind {
            NotificationKind::SignalChange => &mut self.signal_change,
            NotificationKind::FrameBuffered => &mut self.frame_buffered,
            NotificationKind::FrameBuffering => &mut self.frame_buffering,
            NotificationKind::Timer => &mut self.timer,
        }
    }

    pub fn registered(&self) -> impl Iterator<Item = &RegisterableEvent> {
        [
            &self.signal_change,
            &self.frame_buffered,
            &self.frame_buffering,
            &self.timer,
        ]
        .into_iter()
        .filter(|e| e.is_registered())
    }

    pub fn destroy_all(&mut self) {
        self.transfer_complete.destroy();
        self.signal_change.destroy();
        self.frame_buffered.destroy();
        self.frame_buffering.destroy();
        self.timer.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_is_set_once() {
        let mut event = RegisterableEvent::new(NotificationKind::FrameBuffered, Event::soft());
        assert!(!event.is_registered());
        assert_eq!(event.notification(), None);

        let first = Notification::new(NotifyHandle(1), ChannelHandle(7));
        event.register(first);
        event.register(Notification::new(NotifyHandle(2), ChannelHandle(7)));

        assert!(event.is_registered());
        assert_eq!(event.notification(), Some(first));
    }

    #[test]
    fn tokens_depend_only_on_kind() {
        assert_eq!(
            NotificationKind::SignalChange.registration_token(),
            Some(NotifyFlags::SIGNAL_CHANGE)
        );
        assert_eq!(
            NotificationKind::FrameBuffered.registration_token(),
            Some(NotifyFlags::FRAME_BUFFERED)
        );
        assert_eq!(
            NotificationKind::FrameBuffering.registration_token(),
            Some(NotifyFlags::FRAME_BUFFERING)
        );
        assert_eq!(NotificationKind::Timer.registration_token(), None);
        assert_eq!(NotifyFlags::FRAME_BUFFERED.bits(), 0x0400);
    }

    #[test]
    fn grab_event_follows_transfer_mode() {
        let events = DeviceEvents::new(|| Ok(Event::soft())).unwrap();
        assert_eq!(
            events.grab_event(TransferMode::Timer).kind(),
            NotificationKind::Timer
        );
        assert_eq!(
            events.grab_event(TransferMode::Normal).kind(),
            NotificationKind::FrameBuffered
        );
        assert_eq!(
            events.grab_event(TransferMode::LowLatency).kind(),
            NotificationKind::FrameBuffering
        );
    }

    #[test]
    fn destroy_all_can_run_twice() {
        let mut events = DeviceEvents::new(|| Ok(Event::soft())).unwrap();
        events.destroy_all();
        events.destroy_all();
        assert!(events.transfer_complete.is_destroyed());
        assert!(events.timer.event().is_destroyed());
    }
}
