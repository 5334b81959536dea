//! Fetching several independent things at once
//!
//! Some plugins collect a handful of unrelated series from a remote
//! API. They are fetched by a small, fixed number of threads and
//! joined before anything is printed. Each task gets its own result
//! slot, a failing task is logged and leaves its slot empty without
//! disturbing the others.

use anyhow::Result;
use log::{trace, warn};
use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

/// Run `f` on every task with at most `workers` threads.
///
/// The returned vector has one entry per task, in task order: `Some`
/// with the result, or `None` if that task failed.
pub fn collect<T, R, F>(tasks: Vec<T>, workers: usize, f: F) -> Vec<Option<R>>
where
    T: Debug + Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    let mut slots: Vec<Option<R>> = tasks.iter().map(|_| None).collect();
    if tasks.is_empty() {
        return slots;
    }
    let workers = workers.clamp(1, tasks.len());
    trace!("Fetching {} tasks with {} workers", tasks.len(), workers);

    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, R)>();
    thread::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let (tasks, next, f) = (&tasks, &next, &f);
            s.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(task) = tasks.get(i) else {
                    break;
                };
                match f(task) {
                    Ok(result) => {
                        // Receiver lives until the scope is done
                        let _ = tx.send((i, result));
                    }
                    Err(e) => warn!("{:?}: {:#}", task, e),
                }
            });
        }
        drop(tx);
        for (i, result) in rx {
            slots[i] = Some(result);
        }
    });
    slots
}
