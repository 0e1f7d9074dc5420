// The tick loop: one iteration per fixed wall-clock period drives every
// state mutation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::subset::pool::{PoolError, SubsetManagerPool};

pub struct Scheduler {
    pool: SubsetManagerPool,
    period: Duration,
}

impl Scheduler {
    pub fn new(pool: SubsetManagerPool, tick_rate: f64) -> Self {
        Self {
            pool,
            period: Duration::from_secs_f64(1.0 / tick_rate),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run until the stop flag is raised or an inconsistency surfaces.
    /// An overrunning iteration is warned about and the next one starts
    /// immediately; there is no catch-up burst.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), PoolError> {
        let mut tick: u64 = 0;
        while !stop.load(Ordering::SeqCst) {
            let began = Instant::now();
            self.pool.iterate(tick)?;
            let elapsed = began.elapsed();
            if elapsed > self.period {
                log::warn!(
                    "tick {} overran its period by {:?}",
                    tick,
                    elapsed - self.period
                );
            } else {
                thread::sleep(self.period - elapsed);
            }
            tick += 1;
        }
        log::info!("scheduler stopped after {} ticks", tick);
        Ok(())
    }
}
