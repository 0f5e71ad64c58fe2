use crate::time::Timer;
use pump_timer::TimerList;
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Timers ordered by deadline, fired by one worker thread.
#[derive(Debug)]
pub struct TimerQueue {
    name: String,
    running: AtomicBool,
    timers: Mutex<TimerList<Arc<Timer>>>,
    cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(TimerQueue {
            name: name.into(),
            running: AtomicBool::new(false),
            timers: Mutex::new(TimerList::default()),
            cond: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the worker thread.
    ///
    /// # Errors
    /// if already started or the thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some()
            || self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("{} already started", self.name),
            ));
        }
        let queue = self.clone();
        match std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || queue.run())
        {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _guard = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            self.cond.notify_all();
        }
    }

    pub fn wait_stopped(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                crate::error!("{} worker panicked", self.name);
            }
        }
    }

    /// Arm `timer` and queue it. Returns `false` if the queue is not running or
    /// the timer was armed before.
    pub fn start_timer(self: &Arc<Self>, timer: &Arc<Timer>) -> bool {
        if !self.is_running() || !timer.arm(self) {
            return false;
        }
        self.enqueue(timer);
        true
    }

    /// Queue an already armed repeating timer again.
    pub(crate) fn restart_timer(&self, timer: &Arc<Timer>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.enqueue(timer);
        true
    }

    /// Drop `timer` from its deadline entry.
    pub(crate) fn remove_timer(&self, timer: &Arc<Timer>) {
        let removed = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_where(&timer.overtime(), |queued| Arc::ptr_eq(queued, timer));
        drop(removed);
    }

    /// Number of distinct pending deadlines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enqueue(&self, timer: &Arc<Timer>) {
        let overtime = timer.overtime();
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        let earliest = timers.front().map(pump_timer::TimerEntry::get_timestamp);
        timers.insert(overtime, timer.clone());
        if earliest.map_or(true, |earliest| overtime < earliest) {
            self.cond.notify_one();
        }
    }

    fn run(&self) {
        crate::debug!("{} started", self.name);
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        while self.is_running() {
            if let Some(entry) = timers.pop_expired(pump_timer::now()) {
                drop(timers);
                for timer in entry {
                    timer.handle_timeout(self);
                }
                timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
                continue;
            }
            let wait = timers
                .front()
                .map_or(IDLE_WAIT, |entry| {
                    pump_timer::time_left(entry.get_timestamp())
                })
                .min(IDLE_WAIT);
            timers = match self.cond.wait_timeout(timers, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        timers.clear();
        crate::debug!("{} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimerState;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counting(timeout: Duration, repeated: bool) -> (Arc<Timer>, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = Timer::new(timeout, repeated, move || {
            _ = counter.fetch_add(1, Ordering::SeqCst);
        });
        (timer, fired)
    }

    #[test]
    fn fires_in_deadline_order() -> std::io::Result<()> {
        let queue = TimerQueue::new("test-timers");
        queue.start()?;
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut timers = Vec::new();
        for (id, ms) in [(3, 60u64), (1, 20), (2, 40)] {
            let order = order.clone();
            let timer = Timer::new(Duration::from_millis(ms), false, move || {
                order.lock().unwrap().push(id);
            });
            assert!(queue.start_timer(&timer));
            timers.push(timer);
        }
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(timers.iter().all(|t| t.state() == TimerState::Stopped));
        queue.stop();
        queue.wait_stopped();
        Ok(())
    }

    #[test]
    fn stopped_timer_never_fires() -> std::io::Result<()> {
        let queue = TimerQueue::new("test-timers-stop");
        queue.start()?;
        let (timer, fired) = counting(Duration::from_millis(20), false);
        assert!(queue.start_timer(&timer));
        assert!(!queue.start_timer(&timer));
        let (kept, _) = counting(Duration::from_secs(60), false);
        assert!(queue.start_timer(&kept));
        assert_eq!(queue.len(), 2);
        timer.stop();
        assert_eq!(queue.len(), 1);
        timer.stop();
        kept.stop();
        assert!(queue.is_empty());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        queue.stop();
        queue.wait_stopped();
        Ok(())
    }

    #[test]
    fn repeated_timer() -> std::io::Result<()> {
        let queue = TimerQueue::new("test-timers-repeat");
        queue.start()?;
        let (timer, fired) = counting(Duration::from_millis(10), true);
        let begin = Instant::now();
        assert!(queue.start_timer(&timer));
        while fired.load(Ordering::SeqCst) < 3 {
            assert!(begin.elapsed() < Duration::from_secs(3), "repeat timer stalled");
            std::thread::sleep(Duration::from_millis(5));
        }
        timer.stop();
        let count = fired.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert!(fired.load(Ordering::SeqCst) <= count + 1);
        queue.stop();
        queue.wait_stopped();
        assert!(!queue.start_timer(&counting(Duration::from_millis(1), false).0));
        Ok(())
    }
}
