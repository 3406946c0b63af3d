//! The lane runtime: a fixed set of worker threads that all enter the same
//! loop and rendezvous at a barrier between phases.
//!
//! The main loop is divided into phases bracketed by [`LaneRuntime::sync`].
//! Today only lane 0 does useful work inside a phase (all Vulkan, window,
//! and module calls are lane-0-only); the other lanes arrive at the
//! barriers so that future go-wide phases slot in without restructuring
//! the loop. Cancellation is cooperative: lane 0 raises the quit flag,
//! every lane reads it after the final barrier of the iteration, and all
//! lanes leave the loop in the same iteration.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;

/// Number of worker lanes, lane 0 included.
pub const MAX_LANES: usize = 4;

thread_local! {
    static LANE_IDX: Cell<usize> = const { Cell::new(0) };
}

/// Index of the calling thread's lane, in `[0, lane_count)`.
///
/// Threads that were not spawned by the runtime read lane 0, which is
/// correct for the single-threaded headless path.
pub fn lane_idx() -> usize {
    LANE_IDX.with(|idx| idx.get())
}

fn set_lane_idx(idx: usize) {
    LANE_IDX.with(|cell| cell.set(idx));
}

/// Partition `total` items across `lanes`, remainder to the low lanes.
/// Returns the `[lo, hi)` range owned by `lane`.
pub fn split_range(lane: usize, lanes: usize, total: usize) -> (usize, usize) {
    let base = total / lanes;
    let extra = total % lanes;
    let lo = lane * base + lane.min(extra);
    let hi = lo + base + usize::from(lane < extra);
    (lo, hi)
}

/// Outcome of one lane-0 phase; `Quit` ends the loop for every lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Run another iteration.
    Continue,
    /// Raise the quit flag; all lanes exit after the final barrier.
    Quit,
}

/// Barrier-coordinated worker lanes.
pub struct LaneRuntime {
    barrier: Barrier,
    quit: AtomicBool,
    lanes: usize,
}

impl LaneRuntime {
    /// Create a runtime for `lanes` workers (the calling thread is lane 0).
    pub fn new(lanes: usize) -> Self {
        Self {
            barrier: Barrier::new(lanes),
            quit: AtomicBool::new(false),
            lanes,
        }
    }

    /// Number of lanes, lane 0 included.
    pub fn lane_count(&self) -> usize {
        self.lanes
    }

    /// The calling lane's `[lo, hi)` share of `total` items.
    pub fn lane_range(&self, total: usize) -> (usize, usize) {
        split_range(lane_idx(), self.lanes, total)
    }

    /// Two-sided rendezvous: blocks until every lane has arrived.
    pub fn sync(&self) {
        self.barrier.wait();
    }

    /// Raise the quit flag. Lanes observe it after their next barrier.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
    }

    /// Whether quit has been requested.
    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Enter the shared loop. The calling thread becomes lane 0 and runs
    /// `frame` once per iteration; lanes `1..n` run the same phase
    /// structure with no work inside it. Returns when every lane has
    /// exited.
    pub fn run<F>(&self, mut frame: F)
    where
        F: FnMut() -> LoopControl,
    {
        std::thread::scope(|scope| {
            for lane in 1..self.lanes {
                scope.spawn(move || {
                    set_lane_idx(lane);
                    self.follower_loop();
                });
            }

            set_lane_idx(0);
            loop {
                self.sync(); // phase start
                if frame() == LoopControl::Quit {
                    self.request_quit();
                }
                self.sync(); // phase end
                // Quit is read only after the final barrier so no lane is
                // left blocked in the rendezvous.
                if self.quit_requested() {
                    break;
                }
            }
        });
    }

    fn follower_loop(&self) {
        loop {
            self.sync(); // phase start
            // Lane-0-reserved phase; go-wide work would run here.
            self.sync(); // phase end
            if self.quit_requested() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn split_range_partitions_exactly() {
        let lanes = 4;
        for total in [0, 1, 3, 4, 7, 100, 101, 103] {
            let mut covered = 0;
            let mut prev_hi = 0;
            for lane in 0..lanes {
                let (lo, hi) = split_range(lane, lanes, total);
                assert_eq!(lo, prev_hi, "ranges are contiguous");
                assert!(hi >= lo);
                covered += hi - lo;
                prev_hi = hi;
            }
            assert_eq!(covered, total, "every item is owned by exactly one lane");
        }
    }

    #[test]
    fn split_range_favors_low_lanes() {
        // 10 items over 4 lanes: 3, 3, 2, 2.
        assert_eq!(split_range(0, 4, 10), (0, 3));
        assert_eq!(split_range(1, 4, 10), (3, 6));
        assert_eq!(split_range(2, 4, 10), (6, 8));
        assert_eq!(split_range(3, 4, 10), (8, 10));
    }

    #[test]
    fn all_lanes_exit_in_the_same_iteration() {
        let runtime = LaneRuntime::new(4);
        let iterations = AtomicUsize::new(0);
        runtime.run(|| {
            let n = iterations.fetch_add(1, Ordering::SeqCst);
            if n == 2 {
                LoopControl::Quit
            } else {
                LoopControl::Continue
            }
        });
        assert_eq!(iterations.load(Ordering::SeqCst), 3);
        assert!(runtime.quit_requested());
    }

    #[test]
    fn lane_zero_is_the_calling_thread() {
        let runtime = LaneRuntime::new(2);
        runtime.run(|| {
            assert_eq!(lane_idx(), 0);
            LoopControl::Quit
        });
    }
}
