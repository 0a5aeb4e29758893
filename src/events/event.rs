//! Waitable auto-reset events.
//!
//! An [`Event`] owns one wait handle. The mock driver and tests use a portable soft handle; the
//! hardware binding on Windows uses kernel events so the driver can signal them directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{const_mutex, Condvar, Mutex};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("wait timed out")]
    Timeout,
    #[error("cannot wait on a destroyed event")]
    Destroyed,
    #[error("cannot wait on events from different backends in one call")]
    MixedBackends,
    #[error("no events to wait on")]
    Empty,
    #[error("OS wait failed: {0}")]
    Os(String),
}

// Soft events share one wake-up channel; waiters re-check their own flags after every notify.
static WAKE_LOCK: Mutex<()> = const_mutex(());
static WAKE: Condvar = Condvar::new();

#[derive(Debug, Default)]
struct SoftEvent {
    signaled: AtomicBool,
}

impl SoftEvent {
    fn set(&self) {
        let _guard = WAKE_LOCK.lock();
        self.signaled.store(true, Ordering::Release);
        WAKE.notify_all();
    }

    fn take(&self) -> bool {
        self.signaled.swap(false, Ordering::AcqRel)
    }
}

/// Consumes and returns the first signalled event, in list order.
fn wait_soft(events: &[&SoftEvent], timeout: Duration) -> Option<usize> {
    let deadline = Instant::now() + timeout;
    let mut guard = WAKE_LOCK.lock();
    loop {
        if let Some(index) = events.iter().position(|e| e.take()) {
            return Some(index);
        }
        if WAKE.wait_until(&mut guard, deadline).timed_out() {
            return events.iter().position(|e| e.take());
        }
    }
}

#[derive(Debug)]
enum WaitHandle {
    Soft(Arc<SoftEvent>),
    #[cfg(windows)]
    Win32(win32::OwnedEvent),
}

/// Cloneable signalling side of an event, handed to whoever raises it.
///
/// Signalling a destroyed event is a no-op for soft events.
#[derive(Debug, Clone)]
pub struct EventSignaller(SignalTarget);

#[derive(Debug, Clone)]
enum SignalTarget {
    Soft(Arc<SoftEvent>),
    #[cfg(windows)]
    Win32(isize),
}

impl EventSignaller {
    pub fn set(&self) {
        match &self.0 {
            SignalTarget::Soft(event) => event.set(),
            #[cfg(windows)]
            SignalTarget::Win32(raw) => win32::set(*raw),
        }
    }
}

/// An auto-reset, initially unsignalled event.
#[derive(Debug)]
pub struct Event {
    handle: Option<WaitHandle>,
}

impl Event {
    pub fn soft() -> Self {
        Self {
            handle: Some(WaitHandle::Soft(Arc::new(SoftEvent::default()))),
        }
    }

    #[cfg(windows)]
    pub fn win32() -> Result<Self, WaitError> {
        Ok(Self {
            handle: Some(WaitHandle::Win32(win32::OwnedEvent::create()?)),
        })
    }

    pub fn set(&self) {
        if let Some(signaller) = self.signaller() {
            signaller.set();
        }
    }

    /// Releases the handle. Safe to call more than once.
    pub fn destroy(&mut self) {
        match self.handle.take() {
            Some(WaitHandle::Soft(_)) => trace!("soft event destroyed"),
            #[cfg(windows)]
            Some(WaitHandle::Win32(mut event)) => event.close(),
            None => {}
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.is_none()
    }

    pub fn signaller(&self) -> Option<EventSignaller> {
        match self.handle.as_ref()? {
            WaitHandle::Soft(event) => Some(EventSignaller(SignalTarget::Soft(event.clone()))),
            #[cfg(windows)]
            WaitHandle::Win32(event) => Some(EventSignaller(SignalTarget::Win32(event.raw()))),
        }
    }

    /// OS handle value for passing across the driver boundary. `None` for soft events.
    pub fn raw_handle(&self) -> Option<isize> {
        match self.handle.as_ref()? {
            WaitHandle::Soft(_) => None,
            #[cfg(windows)]
            WaitHandle::Win32(event) => Some(event.raw()),
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.destroy();
    }
}

pub fn wait_for_event(event: &Event, timeout: Duration) -> Result<(), WaitError> {
    wait_for_any(&[event], timeout).map(|_| ())
}

/// Blocks until one of `events` is signalled and returns its index.
///
/// When several are signalled, the first one listed wins and only it is reset.
pub fn wait_for_any(events: &[&Event], timeout: Duration) -> Result<usize, WaitError> {
    let handles = events
        .iter()
        .map(|e| e.handle.as_ref().ok_or(WaitError::Destroyed))
        .collect::<Result<Vec<_>, _>>()?;
    let Some(first) = handles.first() else {
        return Err(WaitError::Empty);
    };

    match first {
        WaitHandle::Soft(_) => {
            let soft = handles
                .iter()
                .map(|h| match h {
                    WaitHandle::Soft(event) => Ok(event.as_ref()),
                    #[cfg(windows)]
                    _ => Err(WaitError::MixedBackends),
                })
                .collect::<Result<Vec<_>, WaitError>>()?;
            wait_soft(&soft, timeout).ok_or(WaitError::Timeout)
        }
        #[cfg(windows)]
        WaitHandle::Win32(_) => {
            let raw = handles
                .iter()
                .map(|h| match h {
                    WaitHandle::Win32(event) => Ok(event.raw()),
                    _ => Err(WaitError::MixedBackends),
                })
                .collect::<Result<Vec<_>, WaitError>>()?;
            win32::wait_any(&raw, timeout)
        }
    }
}

#[cfg(windows)]
mod win32 {
    use std::time::Duration;

    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, BOOL, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
    use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects};

    use super::WaitError;

    fn handle(raw: isize) -> HANDLE {
        HANDLE(raw as *mut core::ffi::c_void)
    }

    #[derive(Debug)]
    pub(super) struct OwnedEvent(isize);

    impl OwnedEvent {
        pub(super) fn create() -> Result<Self, WaitError> {
            // SAFETY: unnamed auto-reset event with default security attributes.
            let event = unsafe { CreateEventW(None, BOOL(0), BOOL(0), PCWSTR::null()) }
                .map_err(|e| WaitError::Os(e.to_string()))?;
            Ok(Self(event.0 as isize))
        }

        pub(super) fn raw(&self) -> isize {
            self.0
        }

        pub(super) fn close(&mut self) {
            // SAFETY: the handle was created by CreateEventW and is closed once, by its owner.
            if let Err(e) = unsafe { CloseHandle(handle(self.0)) } {
                tracing::warn!("CloseHandle failed: {e}");
            }
        }
    }

    pub(super) fn set(raw: isize) {
        // SAFETY: SetEvent on a stale handle fails with an error rather than faulting.
        if let Err(e) = unsafe { SetEvent(handle(raw)) } {
            tracing::warn!("SetEvent failed: {e}");
        }
    }

    pub(super) fn wait_any(raw: &[isize], timeout: Duration) -> Result<usize, WaitError> {
        let handles: Vec<HANDLE> = raw.iter().map(|&h| handle(h)).collect();
        let millis = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
        // SAFETY: every handle is owned by a live Event borrowed for the duration of the call.
        let result = unsafe { WaitForMultipleObjects(&handles, BOOL(0), millis) };
        if result == WAIT_TIMEOUT {
            return Err(WaitError::Timeout);
        }
        let index = result.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
        if index < handles.len() {
            Ok(index)
        } else {
            Err(WaitError::Os(format!(
                "WaitForMultipleObjects returned {:#x}",
                result.0
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn set_after(event: &Event, delay: Duration) -> thread::JoinHandle<()> {
        let signaller = event.signaller().unwrap();
        thread::spawn(move || {
            thread::sleep(delay);
            signaller.set();
        })
    }

    #[test]
    fn wait_returns_once_event_is_set() {
        let event = Event::soft();
        let start = Instant::now();
        let setter = set_after(&event, Duration::from_millis(100));

        wait_for_event(&event, Duration::from_secs(1)).unwrap();
        let waited = start.elapsed();
        setter.join().unwrap();

        assert!(waited >= Duration::from_millis(100), "waited {waited:?}");
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");
    }

    #[test]
    fn wait_any_reports_which_event_fired() {
        let first = Event::soft();
        let second = Event::soft();
        let setter = set_after(&second, Duration::from_millis(50));

        let fired = wait_for_any(&[&first, &second], Duration::from_secs(1)).unwrap();
        setter.join().unwrap();
        assert_eq!(fired, 1);
    }

    #[test]
    fn first_listed_event_wins_and_others_stay_signalled() {
        let grab = Event::soft();
        let signal_change = Event::soft();
        signal_change.set();
        grab.set();

        assert_eq!(
            wait_for_any(&[&grab, &signal_change], Duration::from_millis(10)),
            Ok(0)
        );
        assert_eq!(
            wait_for_any(&[&grab, &signal_change], Duration::from_millis(10)),
            Ok(1)
        );
    }

    #[test]
    fn events_auto_reset_after_a_wait() {
        let event = Event::soft();
        event.set();
        event.set();
        assert_eq!(wait_for_event(&event, Duration::from_millis(10)), Ok(()));
        assert_eq!(
            wait_for_event(&event, Duration::from_millis(20)),
            Err(WaitError::Timeout)
        );
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut event = Event::soft();
        event.destroy();
        assert!(event.is_destroyed());
        event.destroy();
        assert!(event.is_destroyed());
        assert!(event.signaller().is_none());
        assert!(event.raw_handle().is_none());
    }

    #[test]
    fn waiting_on_destroyed_event_is_rejected() {
        let mut event = Event::soft();
        event.destroy();
        assert_eq!(
            wait_for_event(&event, Duration::from_millis(10)),
            Err(WaitError::Destroyed)
        );
        assert_eq!(wait_for_any(&[], Duration::ZERO), Err(WaitError::Empty));
    }
}
