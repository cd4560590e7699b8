//! In-process OTA event bus.
//!
//! Mirrors coarse OTA milestones so local subscribers (status LED,
//! watchdog, UI) can react without touching the telemetry channel.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ OTA worker   │────▶│              │     │              │
//! │ Reconciler   │────▶│  Event ring  │────▶│  Subscriber  │
//! │ Publisher    │────▶│  (lock-free) │     │  task        │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! Single producer at a time by construction: the reconciler runs before
//! command dispatch starts, and at most one OTA worker exists.

use core::sync::atomic::{AtomicU8, Ordering};

/// Maximum number of pending bus events.
/// Power of 2 for efficient ring modulo.
const BUS_QUEUE_CAP: usize = 8;

/// Coarse OTA milestones published on the local bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BusEvent {
    /// An update request was acknowledged.
    Init = 1,
    /// The update completed and the new image was confirmed.
    Success = 2,
    /// The update failed or hit a retryable error.
    Failed = 3,
    /// The image is staged; a reboot is imminent.
    PendingReboot = 4,
    /// A subscriber approved the pending reboot.
    ConfirmReboot = 5,
}

static BUS_HEAD: AtomicU8 = AtomicU8::new(0);
static BUS_TAIL: AtomicU8 = AtomicU8::new(0);
// The slot array itself is atomic, so no `static mut` is needed; the
// head/tail indices enforce the SPSC discipline.
static BUS_SLOTS: [AtomicU8; BUS_QUEUE_CAP] = [
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
    AtomicU8::new(0),
];

/// Publish an event onto the bus.
/// Returns `false` if the ring is full (event dropped).
pub fn publish(event: BusEvent) -> bool {
    let head = BUS_HEAD.load(Ordering::Relaxed);
    let tail = BUS_TAIL.load(Ordering::Acquire);
    let next_head = (head + 1) % BUS_QUEUE_CAP as u8;

    if next_head == tail {
        return false; // Ring full — drop event.
    }

    BUS_SLOTS[head as usize].store(event as u8, Ordering::Relaxed);
    BUS_HEAD.store(next_head, Ordering::Release);
    true
}

/// Pop the next event, if any.  Single consumer.
pub fn pop() -> Option<BusEvent> {
    let tail = BUS_TAIL.load(Ordering::Relaxed);
    let head = BUS_HEAD.load(Ordering::Acquire);

    if tail == head {
        return None; // Empty.
    }

    let raw = BUS_SLOTS[tail as usize].load(Ordering::Relaxed);
    BUS_TAIL.store((tail + 1) % BUS_QUEUE_CAP as u8, Ordering::Release);

    event_from_u8(raw)
}

/// Drain all pending events into a callback, FIFO.
pub fn drain(mut handler: impl FnMut(BusEvent)) {
    while let Some(event) = pop() {
        handler(event);
    }
}

fn event_from_u8(raw: u8) -> Option<BusEvent> {
    match raw {
        1 => Some(BusEvent::Init),
        2 => Some(BusEvent::Success),
        3 => Some(BusEvent::Failed),
        4 => Some(BusEvent::PendingReboot),
        5 => Some(BusEvent::ConfirmReboot),
        _ => None,
    }
}
