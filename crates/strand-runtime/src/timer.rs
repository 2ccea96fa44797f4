//! Deadline-ordered timer set
//!
//! Timers are kept in a map ordered by (deadline, insertion id); ties on the
//! deadline resolve by insertion identity. Deadlines use the wall clock so
//! the rollback defense below is meaningful: if the clock moves back by more
//! than an hour, every armed timer is treated as expired and flushed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Callable attached to a timer or scheduled as a task.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Clock rollback beyond this flushes the whole set.
const ROLLOVER_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: SystemTime,
    id: u64,
}

struct TimerEntry {
    period_ms: u64,
    recurring: bool,
    cb: TimerCallback,
}

struct TimerInner {
    timers: BTreeMap<TimerKey, TimerEntry>,
    /// id -> current deadline, so handles can find their entry
    index: HashMap<u64, SystemTime>,
    /// last wall-clock observation, for rollback detection
    previous: SystemTime,
    next_id: u64,
}

pub(crate) struct TimerShared {
    inner: RwLock<TimerInner>,
    /// Single-flight guard: set when the front changed and a wake was sent,
    /// cleared when somebody consults `next_timeout`.
    tickled: AtomicBool,
    /// Invoked (outside the lock) when an insert lands at the front.
    on_front: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

/// The timer set. Owned by the I/O manager, which registers a front-insert
/// waker so a newly earliest deadline shortens the idle loop's sleep.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

/// Handle to an armed timer. Holds no strong reference to the set; every
/// operation revalidates under the set's lock.
pub struct Timer {
    id: u64,
    shared: Weak<TimerShared>,
}

impl TimerManager {
    pub fn new() -> Self {
        TimerManager {
            shared: Arc::new(TimerShared {
                inner: RwLock::new(TimerInner {
                    timers: BTreeMap::new(),
                    index: HashMap::new(),
                    previous: SystemTime::now(),
                    next_id: 1,
                }),
                tickled: AtomicBool::new(false),
                on_front: OnceLock::new(),
            }),
        }
    }

    /// Register the callback fired when an insert becomes the new front.
    /// May only be set once.
    pub(crate) fn set_front_waker(&self, f: impl Fn() + Send + Sync + 'static) {
        let _ = self.shared.on_front.set(Box::new(f));
    }

    /// Arm a timer `ms` milliseconds from now.
    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let deadline = SystemTime::now() + Duration::from_millis(ms);
        let (id, at_front) = {
            let mut inner = self.shared.inner.write();
            let id = inner.next_id;
            inner.next_id += 1;

            let key = TimerKey { deadline, id };
            inner.timers.insert(
                key,
                TimerEntry {
                    period_ms: ms,
                    recurring,
                    cb,
                },
            );
            inner.index.insert(id, deadline);

            let is_front = inner
                .timers
                .first_key_value()
                .map(|(k, _)| *k == key)
                .unwrap_or(false);
            // Single-flight: wake only if nobody has been woken since the
            // last next_timeout() consultation.
            let at_front = is_front && !self.shared.tickled.swap(true, Ordering::AcqRel);
            (id, at_front)
        };

        if at_front {
            if let Some(f) = self.shared.on_front.get() {
                f();
            }
        }

        Timer {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Arm a timer whose callable only runs if `witness` is still alive at
    /// fire time. Used to elide a timeout once the awaited operation has
    /// already completed.
    pub fn add_conditional_timer<W>(
        &self,
        ms: u64,
        cb: TimerCallback,
        witness: Weak<W>,
        recurring: bool,
    ) -> Timer
    where
        W: ?Sized + Send + Sync + 'static,
    {
        let wrapped: TimerCallback = Arc::new(move || {
            if witness.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, wrapped, recurring)
    }

    /// Milliseconds until the earliest deadline: zero if it is already due,
    /// `None` if the set is empty.
    pub fn next_timeout(&self) -> Option<Duration> {
        let inner = self.shared.inner.read();
        self.shared.tickled.store(false, Ordering::Release);

        let (key, _) = inner.timers.first_key_value()?;
        let now = SystemTime::now();
        Some(key.deadline.duration_since(now).unwrap_or(Duration::ZERO))
    }

    /// Append every expired callable to `out`. Recurring timers re-arm at
    /// now + period (a long stall skips intermediate fires); one-shot timers
    /// are dropped.
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = SystemTime::now();
        let mut inner = self.shared.inner.write();
        let rollover = detect_clock_rollover(&mut inner, now);

        loop {
            let key = match inner.timers.first_key_value() {
                Some((k, _)) if rollover || k.deadline <= now => *k,
                _ => break,
            };
            let entry = inner
                .timers
                .remove(&key)
                .expect("first key just observed under the write lock");
            inner.index.remove(&key.id);
            out.push(entry.cb.clone());

            if entry.recurring {
                let deadline = now + Duration::from_millis(entry.period_ms);
                inner.index.insert(key.id, deadline);
                inner.timers.insert(
                    TimerKey {
                        deadline,
                        id: key.id,
                    },
                    entry,
                );
            }
        }
    }

    /// True if any timer is armed.
    pub fn has_timer(&self) -> bool {
        !self.shared.inner.read().timers.is_empty()
    }

    #[cfg(test)]
    fn set_previous_observation(&self, t: SystemTime) {
        self.shared.inner.write().previous = t;
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_clock_rollover(inner: &mut TimerInner, now: SystemTime) -> bool {
    let rollover = now < inner.previous - ROLLOVER_WINDOW;
    inner.previous = now;
    rollover
}

impl Timer {
    /// Disarm the timer. Returns false if it already fired, was cancelled,
    /// or the owning set is gone.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut inner = shared.inner.write();
        let Some(deadline) = inner.index.remove(&self.id) else {
            return false;
        };
        inner.timers.remove(&TimerKey {
            deadline,
            id: self.id,
        });
        true
    }

    /// Push the deadline to now + period. Moves forward only.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut inner = shared.inner.write();
        let Some(&deadline) = inner.index.get(&self.id) else {
            return false;
        };
        let key = TimerKey {
            deadline,
            id: self.id,
        };
        let entry = match inner.timers.remove(&key) {
            Some(e) => e,
            None => return false,
        };
        let deadline = SystemTime::now() + Duration::from_millis(entry.period_ms);
        inner.index.insert(self.id, deadline);
        inner.timers.insert(
            TimerKey {
                deadline,
                id: self.id,
            },
            entry,
        );
        true
    }

    /// Change the period. With `from_now` the deadline restarts from now;
    /// otherwise it shifts by the period delta.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let at_front = {
            let mut inner = shared.inner.write();
            let Some(&old_deadline) = inner.index.get(&self.id) else {
                return false;
            };
            let key = TimerKey {
                deadline: old_deadline,
                id: self.id,
            };
            let mut entry = match inner.timers.remove(&key) {
                Some(e) => e,
                None => return false,
            };

            if ms == entry.period_ms && !from_now {
                inner.timers.insert(key, entry);
                return true;
            }

            let start = if from_now {
                SystemTime::now()
            } else {
                old_deadline - Duration::from_millis(entry.period_ms)
            };
            entry.period_ms = ms;
            let deadline = start + Duration::from_millis(ms);
            let key = TimerKey {
                deadline,
                id: self.id,
            };
            inner.index.insert(self.id, deadline);
            inner.timers.insert(key, entry);

            let is_front = inner
                .timers
                .first_key_value()
                .map(|(k, _)| *k == key)
                .unwrap_or(false);
            is_front && !shared.tickled.swap(true, Ordering::AcqRel)
        };

        if at_front {
            if let Some(f) = shared.on_front.get() {
                f();
            }
        }
        true
    }
}
