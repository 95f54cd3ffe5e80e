use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use parking_lot::Mutex;

use crate::{vulkan::Device, WindowId};

/// Per-window frame progress shared between a renderer and the release
/// queue. A renderer advances it once per presented frame and retires it on
/// shutdown.
pub struct FrameClock {
    frames_drawn: AtomicU64,
    virtual_frames: u8,
    alive: AtomicBool,
}

impl FrameClock {
    fn new(virtual_frames: u8) -> Self {
        Self {
            frames_drawn: AtomicU64::new(0),
            virtual_frames,
            alive: AtomicBool::new(true),
        }
    }

    pub(crate) fn advance(&self) {
        self.frames_drawn.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.frames_drawn.store(0, Ordering::Release);
    }

    pub(crate) fn retire(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn frames_drawn(&self) -> u64 {
        self.frames_drawn.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            frames_drawn: self.frames_drawn(),
            virtual_frames: self.virtual_frames,
            alive: self.alive.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockSnapshot {
    frames_drawn: u64,
    virtual_frames: u8,
    alive: bool,
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    last_frame: u64,
    remaining: i32,
}

struct Entry {
    func: Box<dyn FnOnce() + Send>,
    marks: HashMap<WindowId, Mark>,
}

/// An entry is discharged once every tracked window has advanced at least
/// its ring length past the recorded frame. Windows whose renderer is gone
/// (including ones mid-close) tick their counter down on every update
/// instead, so a dead window can only delay a release, never pin it.
fn entry_is_stale(marks: &mut HashMap<WindowId, Mark>, clocks: &HashMap<WindowId, ClockSnapshot>) -> bool {
    for (window, mark) in marks.iter_mut() {
        match clocks.get(window).filter(|clock| clock.alive) {
            None => mark.remaining -= 1,
            Some(clock) => {
                if mark.remaining > 0 {
                    if clock.frames_drawn < mark.last_frame {
                        // Renderer reset its frame count; stop tracking.
                        mark.remaining = 0;
                    } else {
                        let drawn_since = (clock.frames_drawn - mark.last_frame) as i64;
                        mark.remaining =
                            (clock.virtual_frames as i64 - drawn_since).clamp(i32::MIN as i64, i32::MAX as i64)
                                as i32;
                    }
                }
            }
        }
        if mark.remaining > 0 {
            return false;
        }
    }
    true
}

struct Inner {
    entries: VecDeque<Entry>,
    clocks: HashMap<WindowId, Arc<FrameClock>>,
}

/// Queued destructions that wait until every frame that could have
/// referenced the resource has drained. One mutex guards the queue for its
/// entire lifetime.
pub struct DeferredQueue {
    inner: Mutex<Inner>,
}

impl DeferredQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                clocks: HashMap::new(),
            }),
        })
    }

    /// Registers (or replaces) the frame clock for `window`.
    pub(crate) fn register_clock(&self, window: WindowId, virtual_frames: u8) -> Arc<FrameClock> {
        let clock = Arc::new(FrameClock::new(virtual_frames));
        self.inner.lock().clocks.insert(window, clock.clone());
        clock
    }

    pub(crate) fn unregister_clock(&self, window: WindowId) {
        if let Some(clock) = self.inner.lock().clocks.remove(&window) {
            clock.retire();
        }
    }

    /// Enqueues a destruction gated on all frames currently in flight on
    /// every registered window.
    pub fn release(&self, func: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        let marks = inner
            .clocks
            .iter()
            .filter(|(_, clock)| clock.alive.load(Ordering::Acquire))
            .map(|(window, clock)| {
                let snapshot = clock.snapshot();
                (
                    *window,
                    Mark {
                        last_frame: snapshot.frames_drawn,
                        remaining: snapshot.virtual_frames as i32,
                    },
                )
            })
            .collect();
        inner.entries.push_back(Entry {
            func: Box::new(func),
            marks,
        });
    }

    /// Discharges every stale entry. Funcs run outside the queue lock so
    /// they may enqueue further releases.
    pub fn update(&self) {
        let ready = {
            let mut inner = self.inner.lock();
            let clocks: HashMap<WindowId, ClockSnapshot> = inner
                .clocks
                .iter()
                .map(|(window, clock)| (*window, clock.snapshot()))
                .collect();
            let mut ready = Vec::new();
            let mut keep = VecDeque::with_capacity(inner.entries.len());
            for mut entry in inner.entries.drain(..) {
                if entry_is_stale(&mut entry.marks, &clocks) {
                    ready.push(entry.func);
                } else {
                    keep.push_back(entry);
                }
            }
            inner.entries = keep;
            ready
        };
        for func in ready {
            func();
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn run_all(&self) {
        loop {
            let batch: Vec<_> = {
                let mut inner = self.inner.lock();
                inner.entries.drain(..).map(|entry| entry.func).collect()
            };
            if batch.is_empty() {
                break;
            }
            for func in batch {
                func();
            }
        }
    }

    /// Waits the device idle, then executes every queued release (including
    /// releases enqueued by the releases themselves) until the queue is
    /// empty.
    pub fn drain(&self, device: &Device) -> Result<()> {
        device.wait_idle()?;
        self.run_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn clocks_of(entries: &[(WindowId, u64, u8, bool)]) -> HashMap<WindowId, ClockSnapshot> {
        entries
            .iter()
            .map(|&(window, frames_drawn, virtual_frames, alive)| {
                (
                    window,
                    ClockSnapshot {
                        frames_drawn,
                        virtual_frames,
                        alive,
                    },
                )
            })
            .collect()
    }

    fn marks_of(entries: &[(WindowId, u64, i32)]) -> HashMap<WindowId, Mark> {
        entries
            .iter()
            .map(|&(window, last_frame, remaining)| {
                (
                    window,
                    Mark {
                        last_frame,
                        remaining,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn entry_waits_full_ring_length() {
        let window = WindowId(1);
        let mut marks = marks_of(&[(window, 10, 3)]);
        // Not enough frames drawn yet.
        assert!(!entry_is_stale(&mut marks, &clocks_of(&[(window, 11, 3, true)])));
        assert!(!entry_is_stale(&mut marks, &clocks_of(&[(window, 12, 3, true)])));
        // 13 - 10 >= ring length of 3.
        assert!(entry_is_stale(&mut marks, &clocks_of(&[(window, 13, 3, true)])));
    }

    #[test]
    fn lost_window_ticks_down_instead_of_pinning() {
        let window = WindowId(7);
        let mut marks = marks_of(&[(window, 5, 2)]);
        let clocks = clocks_of(&[]);
        assert!(!entry_is_stale(&mut marks, &clocks));
        assert!(entry_is_stale(&mut marks, &clocks));
    }

    #[test]
    fn retired_clock_counts_as_lost() {
        let window = WindowId(2);
        let mut marks = marks_of(&[(window, 4, 2)]);
        let clocks = clocks_of(&[(window, 4, 2, false)]);
        assert!(!entry_is_stale(&mut marks, &clocks));
        assert!(entry_is_stale(&mut marks, &clocks));
    }

    #[test]
    fn renderer_reset_stops_tracking_window() {
        let window = WindowId(3);
        let mut marks = marks_of(&[(window, 100, 2)]);
        // frames_drawn went backwards: slots were rebuilt.
        assert!(entry_is_stale(&mut marks, &clocks_of(&[(window, 0, 2, true)])));
    }

    #[test]
    fn release_discharges_after_ring_advance() {
        let queue = DeferredQueue::new();
        let clock = queue.register_clock(WindowId(0), 2);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        queue.release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        queue.update();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        clock.advance();
        queue.update();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        clock.advance();
        queue.update();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn run_all_follows_releases_enqueued_by_releases() {
        let queue = DeferredQueue::new();
        let _clock = queue.register_clock(WindowId(0), 2);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let inner_queue = queue.clone();
        queue.release(move || {
            let counter_inner = counter.clone();
            inner_queue.release(move || {
                counter_inner.fetch_add(1, Ordering::SeqCst);
            });
            counter.fetch_add(1, Ordering::SeqCst);
        });
        queue.run_all();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn release_without_clocks_is_immediately_stale() {
        let queue = DeferredQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        queue.release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        queue.update();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
