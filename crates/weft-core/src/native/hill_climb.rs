//! Hill-climbing concurrency controller
//!
//! Feeds on one throughput sample per interval and moves the dispatch-thread
//! count one step at a time: keep going while throughput improves, turn around
//! when it drops, hold while it stays within the noise band. At a bound the
//! count holds, keeping its direction, until throughput drops. An idle sample
//! (zero completions) walks the count back down to the minimum.

/// Resize decision for one sample
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Add one thread
    Grow,
    /// Retire one thread
    Shrink,
    /// Keep the current count
    Hold,
}

/// Relative change below which two samples count as equal
const NOISE: f64 = 0.05;

/// Hill-climbing state machine
#[derive(Debug, Clone)]
pub struct HillClimb {
    min: usize,
    max: usize,
    current: usize,
    /// Direction of the last move; true = growing
    upward: bool,
    last: Option<f64>,
}

impl HillClimb {
    /// Controller over `[min, max]` starting at `start` (clamped)
    pub fn new(min: usize, max: usize, start: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            min,
            max,
            current: start.clamp(min, max),
            upward: true,
            last: None,
        }
    }

    /// Target thread count
    pub fn current(&self) -> usize {
        self.current
    }

    /// Align with the thread count actually running
    pub fn sync(&mut self, current: usize) {
        self.current = current.clamp(self.min, self.max);
    }

    /// Bounds the controller moves within
    pub fn bounds(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    /// Feed one throughput sample (completions per second) and get the move
    pub fn observe(&mut self, throughput: f64) -> Decision {
        let previous = self.last.replace(throughput);

        if throughput <= 0.0 {
            self.upward = false;
            return self.step();
        }

        match previous {
            None => {}
            Some(last) if last <= 0.0 => self.upward = true,
            Some(last) => {
                let change = (throughput - last) / last;
                if change.abs() < NOISE {
                    return Decision::Hold;
                }
                if change < 0.0 {
                    self.upward = !self.upward;
                }
            }
        }
        self.step()
    }

    fn step(&mut self) -> Decision {
        if self.upward && self.current < self.max {
            self.current += 1;
            Decision::Grow
        } else if !self.upward && self.current > self.min {
            self.current -= 1;
            Decision::Shrink
        } else {
            // At a bound: only a throughput drop turns the direction around.
            Decision::Hold
        }
    }
}
