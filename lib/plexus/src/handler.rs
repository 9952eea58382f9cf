use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub type Task<T> = Box<dyn FnOnce(&mut T) + Send>;

struct Queues<T> {
    main: VecDeque<Task<T>>,
    wait: VecDeque<Task<T>>,
    stopped: bool,
}

/// A single worker thread that owns a piece of mutable state and runs posted
/// tasks against it one at a time. Two priorities: the main queue, and a
/// low-priority wait queue drained only while the main queue is empty, which
/// gives posters a quiescence barrier.
pub struct Handler<T> {
    shared: Arc<(Mutex<Queues<T>>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Cloneable posting half of a [`Handler`]. Held by the state itself so
/// tasks can schedule follow-up work.
pub struct Poster<T> {
    shared: Arc<(Mutex<Queues<T>>, Condvar)>,
}

impl<T> Clone for Poster<T> {
    #[inline]
    fn clone(&self) -> Self {
        Poster {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Handler<T> {
    /// Spawns the worker thread and moves `state` into it.
    pub fn new(name: &str, state: T) -> Handler<T> {
        let shared = Arc::new((
            Mutex::new(Queues {
                main: VecDeque::new(),
                wait: VecDeque::new(),
                stopped: false,
            }),
            Condvar::new(),
        ));

        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || Self::run(worker_shared, state))
            .expect("Worker spawn failed");

        Handler {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: Arc<(Mutex<Queues<T>>, Condvar)>, mut state: T) {
        let (lock, condvar) = &*shared;

        loop {
            let task = {
                let mut queues = lock.lock().expect("Worker lock poisoned");

                loop {
                    if let Some(task) = queues.main.pop_front() {
                        break task;
                    }
                    if let Some(task) = queues.wait.pop_front() {
                        break task;
                    }
                    if queues.stopped {
                        return;
                    }
                    queues = condvar.wait(queues).expect("Worker lock poisoned");
                }
            };

            task(&mut state);
        }
    }

    #[inline]
    pub fn poster(&self) -> Poster<T> {
        Poster {
            shared: self.shared.clone(),
        }
    }

    /// Stops the worker after the queued tasks have drained and joins it.
    pub fn stop(&mut self) {
        {
            let (lock, condvar) = &*self.shared;
            let mut queues = lock.lock().expect("Worker lock poisoned");
            queues.stopped = true;
            condvar.notify_all();
        }

        if let Some(thread) = self.thread.take() {
            drop(thread.join());
        }
    }
}

impl<T> Handler<T> {
    #[inline]
    pub fn post(&self, task: Task<T>) -> bool {
        Poster {
            shared: self.shared.clone(),
        }
        .post(task)
    }

    #[inline]
    pub fn post_wait(&self, task: Task<T>) -> bool {
        Poster {
            shared: self.shared.clone(),
        }
        .post_wait(task)
    }
}

impl<T> Drop for Handler<T> {
    fn drop(&mut self) {
        {
            let (lock, condvar) = &*self.shared;
            if let Ok(mut queues) = lock.lock() {
                queues.stopped = true;
                condvar.notify_all();
            }
        }

        if let Some(thread) = self.thread.take() {
            drop(thread.join());
        }
    }
}

impl<T> Poster<T> {
    /// Enqueues a task on the main queue. Returns false if the worker has
    /// stopped.
    pub fn post(&self, task: Task<T>) -> bool {
        let (lock, condvar) = &*self.shared;
        let mut queues = lock.lock().expect("Worker lock poisoned");

        if queues.stopped {
            return false;
        }

        queues.main.push_back(task);
        condvar.notify_all();
        true
    }

    /// Enqueues a task on the low-priority wait queue. It will only run once
    /// the main queue is empty.
    pub fn post_wait(&self, task: Task<T>) -> bool {
        let (lock, condvar) = &*self.shared;
        let mut queues = lock.lock().expect("Worker lock poisoned");

        if queues.stopped {
            return false;
        }

        queues.wait.push_back(task);
        condvar.notify_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_tasks_run_in_order() {
        let handler = Handler::new("test", Vec::<u32>::new());
        let (tx, rx) = mpsc::channel();

        for value in 0..4u32 {
            handler.post(Box::new(move |state: &mut Vec<u32>| state.push(value)));
        }
        handler.post(Box::new(move |state: &mut Vec<u32>| {
            tx.send(state.clone()).unwrap();
        }));

        assert_eq!(rx.recv().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_wait_queue_runs_after_main() {
        let handler = Handler::new("test", Vec::<u32>::new());
        let (tx, rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();

        // Hold the worker inside a main task while the rest is queued.
        handler.post(Box::new(move |_: &mut Vec<u32>| {
            gate_rx.recv().unwrap();
        }));

        // The wait task is posted before the second main task but must
        // observe its effect.
        let wait_tx = tx.clone();
        handler.post_wait(Box::new(move |state: &mut Vec<u32>| {
            wait_tx.send(state.clone()).unwrap();
        }));
        handler.post(Box::new(|state: &mut Vec<u32>| state.push(7)));

        gate_tx.send(()).unwrap();
        assert_eq!(rx.recv().unwrap(), vec![7]);
    }

    #[test]
    fn test_post_after_stop_is_rejected() {
        let mut handler = Handler::new("test", ());
        handler.stop();

        assert!(!handler.post(Box::new(|_| ())));
    }
}
