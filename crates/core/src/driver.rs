//! Double-buffered generation stepping.

use core::future::Future;

use thiserror::Error;

use crate::grid::{Grid, GridError};
use crate::model::{Generation, Simulation};
use crate::rules::{RuleEngine, StepError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("seed grid is {actual_width}x{actual_height}, simulation is {width}x{height}")]
    DimensionMismatch {
        width: usize,
        height: usize,
        actual_width: usize,
        actual_height: usize,
    },

    #[error("invalid seed grid: {0}")]
    Seed(#[from] GridError),
}

/// Failure of [`SimulationDriver::run`]. `E` is the error type of the emit callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunError<E> {
    /// Computing `iteration` failed; nothing was emitted for it.
    Step { iteration: u64, source: StepError },
    /// `iteration` was computed but the callback rejected it.
    Emit { iteration: u64, error: E },
    /// `run` was asked to start from an iteration the driver is not at.
    IterationMismatch { expected: u64, requested: u64 },
}

impl<E: core::fmt::Display> core::fmt::Display for RunError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RunError::Step { iteration, source } => {
                write!(f, "generation {iteration} failed: {source}")
            }
            RunError::Emit { iteration, error } => {
                write!(f, "generation {iteration} was not accepted: {error}")
            }
            RunError::IterationMismatch {
                expected,
                requested,
            } => write!(
                f,
                "driver is at iteration {expected}, run requested from {requested}"
            ),
        }
    }
}

impl<E: core::fmt::Debug + core::fmt::Display> std::error::Error for RunError<E> {}

/// Owns the "current" and "next" grids of one simulation while a job is processed.
///
/// Every step refreshes the toroidal border of "current", computes each cell of "next" through
/// the rule engine, then swaps the two buffers in place.
#[derive(Debug)]
pub struct SimulationDriver<E> {
    engine: E,
    state_count: u16,
    current: Grid,
    next: Grid,
    iteration: u64,
}

impl<E: RuleEngine> SimulationDriver<E> {
    /// Start from `seed`, which is the grid of generation `start_iteration`.
    pub fn resume(
        simulation: &Simulation,
        start_iteration: u64,
        seed: Grid,
        engine: E,
    ) -> Result<Self, DriverError> {
        let (width, height) = (simulation.width as usize, simulation.height as usize);
        if seed.width() != width || seed.height() != height {
            return Err(DriverError::DimensionMismatch {
                width,
                height,
                actual_width: seed.width(),
                actual_height: seed.height(),
            });
        }
        seed.check_states(simulation.state_count)?;

        Ok(Self {
            engine,
            state_count: simulation.state_count,
            next: Grid::new(width, height)?,
            current: seed,
            iteration: start_iteration,
        })
    }

    /// Resume from a persisted checkpoint.
    pub fn from_checkpoint(
        simulation: &Simulation,
        checkpoint: &Generation,
        engine: E,
    ) -> Result<Self, DriverError> {
        let seed = Grid::from_bytes(
            simulation.width as usize,
            simulation.height as usize,
            &checkpoint.content,
        )?;
        Self::resume(simulation, checkpoint.iteration, seed, engine)
    }

    /// Iteration of the grid currently held in "current".
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn current(&self) -> &Grid {
        &self.current
    }

    /// Compute one generation and return it.
    ///
    /// On failure the driver is left unchanged at its previous iteration.
    pub fn step_once(&mut self) -> Result<&Grid, StepError> {
        self.current.wrap_borders();

        for y in 0..self.current.height() {
            for x in 0..self.current.width() {
                let hood = self.current.neighborhood(x, y);
                let state = self.engine.next_state(&hood)?;
                if u16::from(state) >= self.state_count {
                    return Err(StepError::InvalidState {
                        x,
                        y,
                        state,
                        state_count: self.state_count,
                    });
                }
                self.next
                    .set(x, y, state)
                    .map_err(|e| StepError::Engine(e.to_string()))?;
            }
        }

        std::mem::swap(&mut self.current, &mut self.next);
        self.iteration += 1;
        Ok(&self.current)
    }

    /// Step from `from` up to `to_exclusive`, calling `emit(iteration, content)` after each step.
    ///
    /// The next generation is only computed once `emit` for the previous one has resolved. Stops
    /// at the first step or emit failure.
    pub async fn run<F, Fut, Err>(
        &mut self,
        from: u64,
        to_exclusive: u64,
        mut emit: F,
    ) -> Result<(), RunError<Err>>
    where
        F: FnMut(u64, Vec<u8>) -> Fut,
        Fut: Future<Output = Result<(), Err>>,
    {
        if from != self.iteration {
            return Err(RunError::IterationMismatch {
                expected: self.iteration,
                requested: from,
            });
        }

        for iteration in from..to_exclusive {
            let produced = iteration + 1;
            let content = self
                .step_once()
                .map_err(|source| RunError::Step {
                    iteration: produced,
                    source,
                })?
                .to_bytes();
            emit(produced, content)
                .await
                .map_err(|error| RunError::Emit {
                    iteration: produced,
                    error,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{Cell, Neighborhood};
    use crate::id::{OwnerId, SimulationId};
    use crate::model::{Rule, SimulationStatus};
    use crate::rules::ConditionEngine;

    fn simulation(width: u32, height: u32, rules: Vec<Rule>) -> Simulation {
        Simulation {
            id: SimulationId::new(1),
            owner: OwnerId::new(1),
            name: "test".to_string(),
            description: None,
            width,
            height,
            state_count: 2,
            rules,
            status: SimulationStatus::Processing,
        }
    }

    fn engine(sim: &Simulation) -> ConditionEngine {
        ConditionEngine::compile(&sim.rules, sim.state_count).unwrap()
    }

    /// Engine that always answers a fixed (possibly invalid) state.
    struct Constant(Cell);

    impl RuleEngine for Constant {
        fn next_state(&self, _: &Neighborhood) -> Result<Cell, StepError> {
            Ok(self.0)
        }
    }

    #[test]
    fn blinker_oscillates_across_the_wrap() {
        let sim = simulation(
            5,
            5,
            vec![
                Rule::new("self == 0 && live == 3", 1),
                Rule::new("self == 1 && live < 2 || self == 1 && live > 3", 0),
            ],
        );
        // Horizontal blinker straddling the left/right edge.
        let mut seed = Grid::new(5, 5).unwrap();
        for x in [4, 0, 1] {
            seed.set(x, 2, 1).unwrap();
        }
        let mut driver = SimulationDriver::resume(&sim, 0, seed.clone(), engine(&sim)).unwrap();

        let vertical = driver.step_once().unwrap().clone();
        for y in [1, 2, 3] {
            assert_eq!(vertical.get(0, y), Some(1));
        }
        assert_eq!(vertical.get(4, 2), Some(0));

        let back = driver.step_once().unwrap();
        assert_eq!(back.to_bytes(), seed.to_bytes());
        assert_eq!(driver.iteration(), 2);
    }

    #[tokio::test]
    async fn run_emits_every_generation_in_order() {
        let sim = simulation(3, 3, vec![Rule::new("any-live-neighbor", 1)]);
        let mut seed = Grid::new(3, 3).unwrap();
        seed.set(1, 1, 1).unwrap();
        let mut driver = SimulationDriver::resume(&sim, 4, seed, engine(&sim)).unwrap();

        let mut emitted = Vec::new();
        driver
            .run(4, 7, |iteration, content| {
                emitted.push((iteration, content));
                async { Ok::<(), String>(()) }
            })
            .await
            .unwrap();

        let iterations: Vec<u64> = emitted.iter().map(|(i, _)| *i).collect();
        assert_eq!(iterations, vec![5, 6, 7]);
        assert!(emitted.iter().all(|(_, c)| c.len() == 9));
        assert_eq!(emitted[0].1, vec![1; 9]);
        assert_eq!(driver.iteration(), 7);
    }

    #[tokio::test]
    async fn run_stops_at_first_emit_failure() {
        let sim = simulation(2, 2, vec![]);
        let mut driver =
            SimulationDriver::resume(&sim, 0, Grid::new(2, 2).unwrap(), engine(&sim)).unwrap();

        let mut calls = 0;
        let err = driver
            .run(0, 10, |iteration, _| {
                calls += 1;
                async move {
                    if iteration == 2 {
                        Err("disk full".to_string())
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RunError::Emit {
                iteration: 2,
                error: "disk full".to_string()
            }
        );
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn step_failure_is_not_emitted() {
        let sim = simulation(2, 2, vec![]);
        let mut driver =
            SimulationDriver::resume(&sim, 0, Grid::new(2, 2).unwrap(), Constant(7)).unwrap();

        let mut calls = 0;
        let err = driver
            .run(0, 3, |_, _| {
                calls += 1;
                async { Ok::<(), String>(()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RunError::Step {
                iteration: 1,
                source: StepError::InvalidState { state: 7, .. }
            }
        ));
        assert_eq!(calls, 0);
        assert_eq!(driver.iteration(), 0);
    }

    #[tokio::test]
    async fn run_refuses_a_foreign_start_iteration() {
        let sim = simulation(2, 2, vec![]);
        let mut driver =
            SimulationDriver::resume(&sim, 3, Grid::new(2, 2).unwrap(), engine(&sim)).unwrap();

        let err = driver
            .run(0, 5, |_, _| async { Ok::<(), String>(()) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RunError::IterationMismatch {
                expected: 3,
                requested: 0
            }
        );
    }

    #[test]
    fn resume_rejects_mismatched_seed() {
        let sim = simulation(3, 3, vec![]);
        let err = SimulationDriver::resume(&sim, 0, Grid::new(3, 2).unwrap(), engine(&sim))
            .unwrap_err();
        assert!(matches!(err, DriverError::DimensionMismatch { .. }));

        let checkpoint = Generation {
            simulation_id: sim.id,
            iteration: 0,
            content: vec![0; 8],
        };
        let err = SimulationDriver::from_checkpoint(&sim, &checkpoint, engine(&sim)).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Seed(GridError::LengthMismatch { .. })
        ));
    }
}
