//! Host event loop contract
//!
//! The helper needs exactly two things from the daemon's scheduler: a hook
//! that runs on every mainloop iteration and a one-shot task that runs after
//! a number of iterations. [`Scheduler`] is a single-threaded implementation
//! of both, driven by calling [`Scheduler::tick`].

use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};
use tracing::trace;

/// Callback run on every tick
pub type TickHook = Box<dyn FnMut()>;

/// Callback run once, some ticks in the future
pub type Task = Box<dyn FnOnce()>;

/// Identifies a registered tick hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Scheduling primitives provided by the host daemon
pub trait Mainloop {
    /// Register a hook that runs on every tick
    fn add_tick_hook(&self, hook: TickHook) -> HookId;

    /// Unregister a hook; unknown ids are ignored
    fn remove_tick_hook(&self, id: HookId);

    /// Run `task` once, `ticks` iterations from now (at least one)
    fn schedule(&self, ticks: u32, task: Task);

    /// Time left until the scheduler expects to wake up again
    fn sleep_time(&self) -> Duration;
}

struct Scheduled {
    due: u64,
    task: Task,
}

/// Cooperative tick scheduler
///
/// Hooks run in registration order, then every task whose tick has come runs
/// in the order it was scheduled. Hooks and tasks may register further hooks
/// and tasks while running; those take effect from the next tick.
pub struct Scheduler {
    interval: Duration,
    now: Cell<u64>,
    last_tick: Cell<Instant>,
    next_hook: Cell<u64>,
    hooks: RefCell<Vec<(HookId, TickHook)>>,
    removed: RefCell<Vec<HookId>>,
    tasks: RefCell<Vec<Scheduled>>,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            now: Cell::new(0),
            last_tick: Cell::new(Instant::now()),
            next_hook: Cell::new(1),
            hooks: RefCell::new(Vec::new()),
            removed: RefCell::new(Vec::new()),
            tasks: RefCell::new(Vec::new()),
        }
    }

    /// Configured time between two ticks
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of ticks run so far
    pub fn ticks(&self) -> u64 {
        self.now.get()
    }

    /// Number of one-shot tasks waiting to run
    pub fn pending_tasks(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Run one mainloop iteration
    pub fn tick(&self) {
        let now = self.now.get() + 1;
        self.now.set(now);
        self.last_tick.set(Instant::now());

        // Hooks are taken out so they can call back into the scheduler.
        let mut hooks = std::mem::take(&mut *self.hooks.borrow_mut());
        for (id, hook) in hooks.iter_mut() {
            if !self.removed.borrow().contains(id) {
                hook();
            }
        }
        {
            let mut removed = self.removed.borrow_mut();
            hooks.retain(|(id, _)| !removed.contains(id));
            let mut registered = self.hooks.borrow_mut();
            registered.retain(|(id, _)| !removed.contains(id));
            removed.clear();
            hooks.append(&mut *registered);
            *registered = hooks;
        }

        let due: Vec<Scheduled> = {
            let mut tasks = self.tasks.borrow_mut();
            let (due, waiting) = std::mem::take(&mut *tasks)
                .into_iter()
                .partition(|t| t.due <= now);
            *tasks = waiting;
            due
        };
        if !due.is_empty() {
            trace!("Running {} scheduled task(s) on tick {}", due.len(), now);
        }
        for scheduled in due {
            (scheduled.task)();
        }
    }
}

impl Mainloop for Scheduler {
    fn add_tick_hook(&self, hook: TickHook) -> HookId {
        let id = HookId(self.next_hook.get());
        self.next_hook.set(id.0 + 1);
        self.hooks.borrow_mut().push((id, hook));
        id
    }

    fn remove_tick_hook(&self, id: HookId) {
        // The hook list may be taken out while ticking; record the removal
        // so `tick` can drop it once the list is back.
        self.hooks.borrow_mut().retain(|(hook, _)| *hook != id);
        self.removed.borrow_mut().push(id);
    }

    fn schedule(&self, ticks: u32, task: Task) {
        let due = self.now.get() + u64::from(ticks.max(1));
        self.tasks.borrow_mut().push(Scheduled { due, task });
    }

    fn sleep_time(&self) -> Duration {
        self.interval.saturating_sub(self.last_tick.get().elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_hooks_run_every_tick() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        scheduler.add_tick_hook(Box::new(move || c.set(c.get() + 1)));

        scheduler.tick();
        scheduler.tick();
        scheduler.tick();
        assert_eq!(count.get(), 3);
        assert_eq!(scheduler.ticks(), 3);
    }

    #[test]
    fn test_removed_hook_stops_running() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let id = scheduler.add_tick_hook(Box::new(move || c.set(c.get() + 1)));

        scheduler.tick();
        scheduler.remove_tick_hook(id);
        scheduler.tick();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_task_runs_after_requested_ticks() {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        scheduler.schedule(2, Box::new(move || r.set(true)));

        scheduler.tick();
        assert!(!ran.get());
        scheduler.tick();
        assert!(ran.get());
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[test]
    fn test_task_scheduled_from_task_runs_next_tick() {
        let scheduler = Rc::new(Scheduler::new(Duration::from_millis(10)));
        let order = Rc::new(RefCell::new(Vec::new()));

        let s = scheduler.clone();
        let o = order.clone();
        scheduler.schedule(
            1,
            Box::new(move || {
                o.borrow_mut().push(s.ticks());
                let o2 = o.clone();
                let s2 = s.clone();
                s.schedule(0, Box::new(move || o2.borrow_mut().push(s2.ticks())));
            }),
        );

        scheduler.tick();
        scheduler.tick();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_hook_can_remove_itself() {
        let scheduler = Rc::new(Scheduler::new(Duration::from_millis(10)));
        let count = Rc::new(Cell::new(0));
        let own_id = Rc::new(Cell::new(None));

        let s = scheduler.clone();
        let c = count.clone();
        let id_cell = own_id.clone();
        let id = scheduler.add_tick_hook(Box::new(move || {
            c.set(c.get() + 1);
            if let Some(id) = id_cell.get() {
                s.remove_tick_hook(id);
            }
        }));
        own_id.set(Some(id));

        scheduler.tick();
        scheduler.tick();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_sleep_time_bounded_by_interval() {
        let scheduler = Scheduler::new(Duration::from_millis(50));
        scheduler.tick();
        assert!(scheduler.sleep_time() <= Duration::from_millis(50));
    }
}
