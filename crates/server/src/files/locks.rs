//! Optional per-path advisory locks.
//!
//! When mutations are serialized, every copy/move/rename/upload holds the
//! lock of each resolved path it touches for the whole operation. Paths
//! are locked in sorted order so two operations over the same pair cannot
//! deadlock.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use dashmap::DashMap;

#[derive(Debug, Default)]
struct Slot {
    held: Mutex<bool>,
    released: Condvar,
}

/// Lock table keyed by absolute path.
#[derive(Debug, Default)]
pub struct PathLocks {
    slots: DashMap<PathBuf, Arc<Slot>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every path in `paths` is held by the caller.
    pub fn acquire(&self, paths: &[&Path]) -> PathLockGuard<'_> {
        let mut sorted: Vec<PathBuf> = paths.iter().map(|p| p.to_path_buf()).collect();
        sorted.sort();
        sorted.dedup();

        let mut held = Vec::with_capacity(sorted.len());
        for path in sorted {
            let slot = Arc::clone(self.slots.entry(path.clone()).or_default().value());

            let mut taken = slot.held.lock().unwrap_or_else(PoisonError::into_inner);
            while *taken {
                taken = slot
                    .released
                    .wait(taken)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *taken = true;
            drop(taken);

            held.push((path, slot));
        }

        PathLockGuard { locks: self, held }
    }

    /// Number of paths with a live slot.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Releases its paths on drop.
#[derive(Debug)]
pub struct PathLockGuard<'a> {
    locks: &'a PathLocks,
    held: Vec<(PathBuf, Arc<Slot>)>,
}

impl Drop for PathLockGuard<'_> {
    fn drop(&mut self) {
        for (path, slot) in self.held.drain(..).rev() {
            {
                let mut taken = slot.held.lock().unwrap_or_else(PoisonError::into_inner);
                *taken = false;
            }
            slot.released.notify_one();
            drop(slot);

            // Slots are cloned under the shard lock, so a count of one
            // means nobody is waiting on this path.
            self.locks
                .slots
                .remove_if(&path, |_, slot| Arc::strong_count(slot) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_guard_releases_slots() {
        let locks = PathLocks::new();
        {
            let _guard = locks.acquire(&[Path::new("/r/b"), Path::new("/r/a")]);
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[test]
    fn test_duplicate_paths_do_not_self_deadlock() {
        let locks = PathLocks::new();
        let _guard = locks.acquire(&[Path::new("/r/a"), Path::new("/r/a")]);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_overlapping_operations_are_serialized() {
        let locks = Arc::new(PathLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    // Alternate the argument order to exercise sorted acquisition.
                    let (a, b) = if i % 2 == 0 {
                        (Path::new("/r/a"), Path::new("/r/b"))
                    } else {
                        (Path::new("/r/b"), Path::new("/r/a"))
                    };
                    let _guard = locks.acquire(&[a, b]);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }
}
