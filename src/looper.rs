//! A game loop driver with fixed and variable time steps.

use std::time::{Duration, Instant};

/// A function run by the loop.
///
/// Receives the total elapsed clock time and the duration of the step, and
/// returns whether the loop should continue.
pub type LoopFunction = Box<dyn FnMut(Duration, Duration) -> bool>;

/// Drives a game loop with two callbacks: one called at a fixed time step
/// and one called once per iteration with the variable frame time. Based on
/// the classic fix-your-timestep accumulator scheme: the variable step
/// produces time, the fixed step consumes it.
///
/// No attempt is made to cap catch-up iterations; a long frame is paid back
/// in full with repeated fixed steps.
pub struct Looper {
    /// Total elapsed time handed to the step functions.
    clock: Duration,

    /// Interval between fixed time step calls.
    timestep: Duration,

    /// Function run at the fixed time step.
    fixed_timestep: LoopFunction,

    /// Function run once per loop iteration.
    variable_timestep: LoopFunction,
}

impl Looper {
    /// Construct a new looper.
    ///
    /// `clock` is the starting value of elapsed time, `timestep` the fixed
    /// interval. The loop does not start until [`run`](Looper::run).
    pub fn new(
        clock: Duration,
        timestep: Duration,
        fixed_timestep: LoopFunction,
        variable_timestep: LoopFunction,
    ) -> Looper {
        Looper {
            clock,
            timestep,
            fixed_timestep,
            variable_timestep,
        }
    }

    /// Run the loop until one of the step functions returns false.
    pub fn run(&mut self) {
        let mut running = true;
        let mut start = Instant::now();
        let mut accumulator = Duration::ZERO;

        while running {
            // Duration of the last frame.
            let end = Instant::now();
            let frame_time = end - start;
            start = end;

            accumulator += frame_time;

            while running && accumulator >= self.timestep {
                running &= (self.fixed_timestep)(self.clock, self.timestep);

                accumulator -= self.timestep;
                self.clock += self.timestep;
            }

            running &= (self.variable_timestep)(self.clock, frame_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn fixed_step_consumes_accumulated_time() {
        let fixed_calls = Arc::new(AtomicU32::new(0));
        let calls = fixed_calls.clone();

        let mut looper = Looper::new(
            Duration::ZERO,
            Duration::from_millis(1),
            Box::new(move |_, delta| {
                assert_eq!(delta, Duration::from_millis(1));
                calls.fetch_add(1, Ordering::SeqCst) < 4
            }),
            Box::new(|_, _| {
                // Let time pass so the accumulator always has something to
                // hand to the fixed step.
                std::thread::sleep(Duration::from_millis(2));
                true
            }),
        );

        looper.run();

        assert_eq!(fixed_calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn variable_step_can_stop_the_loop() {
        let variable_calls = Arc::new(AtomicU32::new(0));
        let calls = variable_calls.clone();

        let mut looper = Looper::new(
            Duration::ZERO,
            Duration::from_secs(3600),
            Box::new(|_, _| panic!("fixed step should never accumulate")),
            Box::new(move |_, _| calls.fetch_add(1, Ordering::SeqCst) < 2),
        );

        looper.run();

        assert_eq!(variable_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn clock_advances_by_fixed_steps() {
        let mut looper = Looper::new(
            Duration::from_secs(10),
            Duration::from_millis(1),
            Box::new(move |clock, _| {
                // Clock starts at the constructed value and advances in
                // whole timesteps.
                assert!(clock >= Duration::from_secs(10));
                assert_eq!(clock.subsec_nanos() % 1_000_000, 0);
                clock < Duration::from_secs(10) + Duration::from_millis(3)
            }),
            Box::new(|_, _| {
                std::thread::sleep(Duration::from_millis(2));
                true
            }),
        );

        looper.run();
    }
}
