//! Scheduler for delayed events, used by \<send\> with a 'delay' and by \<cancel\>.\
//! Deadlines are taken against the monotonic timer clock at schedule time, wall-clock
//! adjustments do not affect pending events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use crate::common::{debug, error};
use crate::fsm::SessionId;

/// A delivery job. Runs on one of the delivery threads, never on the timer thread,
/// so a target that calls back into an interpreter cannot deadlock the timer.
pub type ScheduledJob = Box<dyn FnOnce() + Send + 'static>;

/// Number of threads that execute fired jobs.
const DELIVERY_THREAD_COUNT: usize = 2;

struct ScheduledEntry {
    cancelled: Arc<AtomicBool>,
    session_id: Option<SessionId>,
    /// Dropping the guard cancels the pending timer callback.
    _guard: timer::Guard,
}

enum DeliveryTask {
    Run(ScheduledJob),
    Stop,
}

struct DeliveryPool {
    sender: Sender<DeliveryTask>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DeliveryPool {
    fn new() -> DeliveryPool {
        let (sender, receiver) = channel::<DeliveryTask>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(DELIVERY_THREAD_COUNT);
        for i in 0..DELIVERY_THREAD_COUNT {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("fsm_event_delivery_{}", i))
                .spawn(move || loop {
                    let task = {
                        let guard = receiver.lock().unwrap();
                        guard.recv()
                    };
                    match task {
                        Ok(DeliveryTask::Run(job)) => job(),
                        Ok(DeliveryTask::Stop) | Err(_) => break,
                    }
                })
                .unwrap();
            workers.push(worker);
        }
        DeliveryPool {
            sender,
            workers: Mutex::new(workers),
        }
    }

    fn submit(&self, job: ScheduledJob) {
        if self.sender.send(DeliveryTask::Run(job)).is_err() {
            error!("Delivery pool is down, event discarded");
        }
    }

    fn shutdown(&self, wait: bool) {
        for _ in 0..DELIVERY_THREAD_COUNT {
            let _ = self.sender.send(DeliveryTask::Stop);
        }
        if wait {
            let mut workers = self.workers.lock().unwrap();
            while let Some(w) = workers.pop() {
                let _ = w.join();
            }
        }
    }
}

/// Process-wide scheduler for delayed events.\
/// One timer thread (inside [timer::Timer]) sleeps until the earliest deadline,
/// fired events are handed to a small delivery pool.
/// Each pending event is identified by its send-id, as used by \<cancel\>.
pub struct EventScheduler {
    timer: Mutex<timer::Timer>,
    entries: Arc<Mutex<HashMap<String, ScheduledEntry>>>,
    pool: Arc<DeliveryPool>,
    send_id_counter: AtomicU64,
}

impl Default for EventScheduler {
    fn default() -> Self {
        EventScheduler::new()
    }
}

impl EventScheduler {
    pub fn new() -> EventScheduler {
        EventScheduler {
            timer: Mutex::new(timer::Timer::new()),
            entries: Arc::new(Mutex::new(HashMap::new())),
            pool: Arc::new(DeliveryPool::new()),
            send_id_counter: AtomicU64::new(1),
        }
    }

    /// Mints a send-id for a \<send\> without an 'id' attribute.
    pub fn next_send_id(&self) -> String {
        format!(
            "auto_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            self.send_id_counter.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Runs the job on the delivery pool without any delay.
    pub fn deliver(&self, job: ScheduledJob) {
        self.pool.submit(job);
    }

    /// Schedules the job after the given delay.\
    /// Returns the effective send-id. A user supplied send-id that is still
    /// pending is rejected (W3C requires send-ids of pending events to be unique).
    pub fn schedule(
        &self,
        job: ScheduledJob,
        delay_ms: i64,
        send_id: Option<String>,
        session_id: Option<SessionId>,
    ) -> Result<String, String> {
        let effective_id = match send_id {
            Some(id) if !id.is_empty() => id,
            _ => self.next_send_id(),
        };

        if delay_ms <= 0 {
            self.deliver(job);
            return Ok(effective_id);
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let job_slot = Arc::new(Mutex::new(Some(job)));

        let guard;
        {
            let mut entries = self.entries.lock().unwrap();
            if entries.contains_key(&effective_id) {
                return Err(format!("send id '{}' is already scheduled", effective_id));
            }

            let cb_cancelled = cancelled.clone();
            let cb_entries = self.entries.clone();
            let cb_pool = self.pool.clone();
            let cb_id = effective_id.clone();
            guard = self.timer.lock().unwrap().schedule_with_delay(
                chrono::Duration::milliseconds(delay_ms),
                move || {
                    // Remove first: a cancel arriving from now on is too late.
                    cb_entries.lock().unwrap().remove(&cb_id);
                    if cb_cancelled.load(Ordering::SeqCst) {
                        debug!("Scheduled event '{}' was cancelled before firing", cb_id);
                        return;
                    }
                    if let Some(job) = job_slot.lock().unwrap().take() {
                        cb_pool.submit(job);
                    }
                },
            );
            entries.insert(
                effective_id.clone(),
                ScheduledEntry {
                    cancelled,
                    session_id,
                    _guard: guard,
                },
            );
        }
        Ok(effective_id)
    }

    /// Cancels a pending event.\
    /// Returns true if the event was still pending. Cancelling an unknown or
    /// already fired id is a no-op; calling it twice equals calling it once.
    pub fn cancel(&self, send_id: &str) -> bool {
        match self.entries.lock().unwrap().remove(send_id) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Cancels all pending events of the given session, returns the number of
    /// cancelled events. Called when a session terminates.
    pub fn cancel_session(&self, session_id: SessionId) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.session_id == Some(session_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            if let Some(entry) = entries.remove(id) {
                entry.cancelled.store(true, Ordering::SeqCst);
            }
        }
        doomed.len()
    }

    /// True if a event with this send-id is still pending.
    pub fn has_event(&self, send_id: &str) -> bool {
        match self.entries.lock().unwrap().get(send_id) {
            Some(entry) => !entry.cancelled.load(Ordering::SeqCst),
            None => false,
        }
    }

    pub fn scheduled_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn shutdown(&self, wait: bool) {
        {
            let mut entries = self.entries.lock().unwrap();
            for entry in entries.values() {
                entry.cancelled.store(true, Ordering::SeqCst);
            }
            entries.clear();
        }
        self.pool.shutdown(wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn counting_job(counter: &Arc<AtomicU32>) -> ScheduledJob {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_after_delay() {
        let scheduler = EventScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .schedule(counting_job(&fired), 20, None, None)
            .unwrap();
        assert!(id.starts_with("auto_"));
        assert!(scheduler.has_event(&id));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.has_event(&id));
        scheduler.shutdown(true);
    }

    #[test]
    fn cancel_suppresses_delivery() {
        let scheduler = EventScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let id = scheduler
            .schedule(counting_job(&fired), 100, Some("t".to_string()), None)
            .unwrap();
        assert_eq!(id, "t");
        assert!(scheduler.cancel("t"));
        assert!(!scheduler.has_event("t"));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.shutdown(true);
    }

    #[test]
    fn cancel_is_idempotent() {
        let scheduler = EventScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(counting_job(&fired), 100, Some("x".to_string()), None)
            .unwrap();
        assert!(scheduler.cancel("x"));
        assert!(!scheduler.cancel("x"));
        // Unknown ids are a no-op.
        assert!(!scheduler.cancel("unknown"));
        scheduler.shutdown(true);
    }

    #[test]
    fn duplicate_pending_send_id_is_rejected() {
        let scheduler = EventScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(counting_job(&fired), 500, Some("dup".to_string()), None)
            .unwrap();
        assert!(scheduler
            .schedule(counting_job(&fired), 500, Some("dup".to_string()), None)
            .is_err());
        scheduler.shutdown(true);
    }

    #[test]
    fn session_cancel_removes_all_pending_of_session() {
        let scheduler = EventScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(counting_job(&fired), 300, Some("a".to_string()), Some(1))
            .unwrap();
        scheduler
            .schedule(counting_job(&fired), 300, Some("b".to_string()), Some(1))
            .unwrap();
        scheduler
            .schedule(counting_job(&fired), 300, Some("c".to_string()), Some(2))
            .unwrap();
        assert_eq!(scheduler.cancel_session(1), 2);
        assert!(scheduler.has_event("c"));
        assert!(!scheduler.has_event("a"));
        scheduler.shutdown(true);
    }

    #[test]
    fn zero_delay_is_delivered_directly() {
        let scheduler = EventScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        scheduler
            .schedule(counting_job(&fired), 0, None, None)
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        scheduler.shutdown(true);
    }
}
