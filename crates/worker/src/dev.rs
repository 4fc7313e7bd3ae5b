//! Development mode: a throwaway schema with one demo simulation in it.

use anyhow::Context;
use tracing::{info, warn};

use cellfleet_core::{Grid, NewSimulation, OwnerId, Rule};
use cellfleet_infra::store::schema;
use cellfleet_infra::submit_simulation;

use crate::backends::Backends;

const DEMO_SIZE: usize = 32;
const DEMO_GENERATIONS: u64 = 100;
const GLIDER: [(usize, usize); 5] = [(1, 0), (2, 1), (0, 2), (1, 2), (2, 2)];

pub async fn prepare(backends: &Backends) -> anyhow::Result<()> {
    schema::ensure_schema(backends.postgres.pool())
        .await
        .context("creating development schema")?;

    let mut seed = Grid::new(DEMO_SIZE, DEMO_SIZE)?;
    for (x, y) in GLIDER {
        seed.set(x, y, 1)?;
    }
    let demo = NewSimulation {
        owner: OwnerId::new(1),
        name: "demo glider".to_string(),
        description: Some("Conway's life on a 32x32 torus".to_string()),
        width: DEMO_SIZE as u32,
        height: DEMO_SIZE as u32,
        state_count: 2,
        rules: vec![
            Rule::new("self == 0 && live == 3", 1),
            Rule::new("self == 1 && live < 2 || self == 1 && live > 3", 0),
        ],
    };

    let store = &*backends.postgres;
    let backlog = backends.backlog();
    submit_simulation(store, store, &*backlog, demo, &seed, DEMO_GENERATIONS)
        .await
        .context("seeding demo simulation")?;
    Ok(())
}

/// Drop everything `prepare` created. Failures are logged; the process is exiting anyway.
pub async fn teardown(backends: &Backends) {
    #[cfg(feature = "redis")]
    if let Some(queue) = &backends.queue {
        if let Err(err) = queue.purge().await {
            warn!(error = %err, "failed to purge development queue");
        }
    }

    match schema::drop_schema(backends.postgres.pool()).await {
        Ok(()) => info!("development schema dropped"),
        Err(err) => warn!(error = %err, "failed to drop development schema"),
    }
}
