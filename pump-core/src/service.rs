use crate::config::Config;
use crate::poll::channel::{ChannelEvent, ChannelKey, ChannelRegistry};
use crate::poll::tracker::ChannelTracker;
use crate::poll::{Poller, PollerId};
use crate::time::{Timer, TimerQueue};
use crossbeam_deque::{Injector, Steal};
use std::fmt::{Debug, Formatter};
use std::io::{Error, ErrorKind};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send>;

struct TaskQueue {
    running: AtomicBool,
    tasks: Injector<Task>,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Debug for TaskQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("running", &self.running)
            .field("pending", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl TaskQueue {
    fn push(&self, task: Task) {
        self.tasks.push(task);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        loop {
            match self.tasks.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    fn run(&self, name: &str, wait: std::time::Duration) {
        crate::info!("{name} started");
        while self.running.load(Ordering::Acquire) {
            if let Some(task) = self.pop() {
                if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    crate::error!("{name} posted task panicked");
                }
                continue;
            }
            let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.tasks.is_empty() && self.running.load(Ordering::Acquire) {
                drop(
                    self.cond
                        .wait_timeout(guard, wait)
                        .unwrap_or_else(PoisonError::into_inner),
                );
            }
        }
        crate::info!("{name} stopped");
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.cond.notify_all();
        }
    }
}

/// The context every transport runs in: a read poller, a send poller, a
/// timer queue and a worker for posted tasks.
///
/// Nothing is process wide; create as many services as needed and hand them to
/// the transports explicitly.
#[derive(Debug)]
pub struct Service {
    config: Config,
    running: AtomicBool,
    registry: Arc<ChannelRegistry>,
    pollers: [Poller; 2],
    timers: Arc<TimerQueue>,
    tasks: Arc<TaskQueue>,
    task_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Service {
    /// Create the pollers with the configured backend. Nothing runs before
    /// [`Service::start`].
    ///
    /// # Errors
    /// if a backend cannot be created.
    pub fn new(config: Config) -> std::io::Result<Arc<Self>> {
        let registry = Arc::new(ChannelRegistry::default());
        let create = |id: PollerId| -> std::io::Result<Poller> {
            Ok(Poller::new(
                format!("{}-{}-poller", config.get_name(), id.to_string().to_lowercase()),
                config.get_backend().create()?,
                registry.clone(),
                config.get_poll_timeout(),
            ))
        };
        let pollers = [create(PollerId::Read)?, create(PollerId::Send)?];
        Ok(Arc::new(Service {
            timers: TimerQueue::new(format!("{}-timer", config.get_name())),
            tasks: Arc::new(TaskQueue {
                running: AtomicBool::new(false),
                tasks: Injector::new(),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
            task_worker: Mutex::new(None),
            running: AtomicBool::new(false),
            registry,
            pollers,
            config,
        }))
    }

    /// Create and start a service.
    ///
    /// # Errors
    /// see [`Service::new`] and [`Service::start`].
    pub fn launch(config: Config) -> std::io::Result<Arc<Self>> {
        let service = Self::new(config)?;
        service.start()?;
        Ok(service)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn get_name(&self) -> &str {
        self.config.get_name()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start both pollers, the timer queue and the task worker.
    ///
    /// # Errors
    /// if already started or a thread cannot be spawned. Whatever was started
    /// is stopped again.
    pub fn start(&self) -> std::io::Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("{} already started", self.get_name()),
            ));
        }
        if let Err(e) = self.start_workers() {
            crate::error!("{} start failed: {e}", self.get_name());
            self.stop();
            self.wait_stopped();
            return Err(e);
        }
        crate::info!("{} started", self.get_name());
        Ok(())
    }

    fn start_workers(&self) -> std::io::Result<()> {
        for poller in &self.pollers {
            poller.start()?;
        }
        self.timers.start()?;
        let mut worker = self
            .task_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.tasks.running.store(true, Ordering::Release);
        let tasks = self.tasks.clone();
        let name = format!("{}-task", self.get_name());
        let wait = self.config.get_task_wait();
        *worker = Some(
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || tasks.run(&name, wait))?,
        );
        Ok(())
    }

    /// Ask every worker to exit and drop all registered channels.
    /// See [`Service::wait_stopped`].
    pub fn stop(&self) {
        _ = self.running.swap(false, Ordering::AcqRel);
        for poller in &self.pollers {
            poller.stop();
        }
        self.timers.stop();
        self.tasks.stop();
    }

    /// Block until every worker exited, then drop the channels left in the
    /// registry.
    pub fn wait_stopped(&self) {
        for poller in &self.pollers {
            poller.wait_stopped();
        }
        self.timers.wait_stopped();
        let handle = self
            .task_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                crate::error!("{} task worker panicked", self.get_name());
            }
        }
        if !self.is_running() {
            self.registry.clear();
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn poller(&self, id: PollerId) -> &Poller {
        &self.pollers[id.index()]
    }

    /// See [`Poller::add_channel_tracker`].
    pub fn add_channel_tracker(&self, tracker: &Arc<ChannelTracker>, id: PollerId) -> bool {
        self.poller(id).add_channel_tracker(tracker)
    }

    /// See [`Poller::remove_channel_tracker`].
    pub fn remove_channel_tracker(&self, tracker: &Arc<ChannelTracker>, id: PollerId) {
        self.poller(id).remove_channel_tracker(tracker);
    }

    /// See [`Poller::resume_channel_tracker`].
    pub fn resume_channel_tracker(&self, tracker: &Arc<ChannelTracker>, id: PollerId) -> bool {
        self.poller(id).resume_channel_tracker(tracker)
    }

    /// Run the handler of the channel under `key` on the send poller thread.
    pub fn post_channel_event(&self, key: ChannelKey, event: ChannelEvent) -> bool {
        self.poller(PollerId::Send).push_channel_event(key, event)
    }

    /// Run `task` on the task worker. Returns `false` if the service is not running.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.tasks.running.load(Ordering::Acquire) {
            return false;
        }
        self.tasks.push(Box::new(task));
        true
    }

    /// See [`TimerQueue::start_timer`].
    pub fn start_timer(&self, timer: &Arc<Timer>) -> bool {
        self.timers.start_timer(timer)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
        self.wait_stopped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn lifecycle() -> std::io::Result<()> {
        let service = Service::new(Config::default())?;
        assert!(!service.is_running());
        assert!(!service.post(|| {}));
        service.start()?;
        assert!(service.is_running());
        assert!(service.start().is_err());
        assert!(service.poller(PollerId::Read).is_running());
        assert!(service.poller(PollerId::Send).is_running());
        service.stop();
        service.wait_stopped();
        assert!(!service.poller(PollerId::Read).is_running());
        assert!(service.registry().is_empty());
        Ok(())
    }

    #[test]
    fn posted_tasks_survive_panics() -> std::io::Result<()> {
        let service = Service::launch(Config::default())?;
        let ran = Arc::new(AtomicUsize::new(0));
        assert!(service.post(|| panic!("boom")));
        for _ in 0..10 {
            let ran = ran.clone();
            assert!(service.post(move || {
                _ = ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for _ in 0..200 {
            if ran.load(Ordering::SeqCst) == 10 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        Ok(())
    }

    #[test]
    fn timers_run_on_service() -> std::io::Result<()> {
        let service = Service::launch(Config::default())?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        let timer = Timer::new(Duration::from_millis(10), false, move || {
            _ = tx.try_send(());
        });
        assert!(service.start_timer(&timer));
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        Ok(())
    }
}
