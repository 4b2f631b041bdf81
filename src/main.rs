use anyhow::{bail, Result};
use ess_power::config::Config;
use ess_power::controller::{CycleRunner, SetpointController};
use ess_power::domain::{EssRef, SimulatedEss};
use ess_power::telemetry::{init_tracing, shutdown_signal};
use ess_power::EssPower;
use std::sync::Arc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;
    if cfg.devices.is_empty() {
        bail!("no ESS configured, add at least one [[devices]] entry");
    }

    let simulated: Vec<Arc<SimulatedEss>> = cfg
        .devices
        .iter()
        .cloned()
        .map(|d| Arc::new(SimulatedEss::new(d)))
        .collect();

    let mut builder = EssPower::builder()
        .apparent_power_facets(cfg.solver.facets)
        .solver(cfg.solver.solver())
        .rounding(cfg.solver.rounding)
        .cluster_strategy(cfg.solver.cluster_strategy);
    for ess in &simulated {
        builder = builder.add_ess(ess.clone() as EssRef);
    }
    for cluster in &cfg.clusters {
        builder = builder.add_cluster(cluster.cluster()?);
    }
    let mut power = builder.build()?;

    let mut runner = CycleRunner::new();
    for sp in &cfg.setpoints {
        let mut controller = SetpointController::new(sp.target.clone(), sp.active_power_w);
        if let Some(var) = sp.reactive_power_var {
            controller = controller.with_reactive_power(var);
        }
        if sp.ramp {
            controller = controller.ramped(&cfg.ramp);
        }
        runner.add_controller(Box::new(controller));
    }

    info!(
        devices = simulated.len(),
        clusters = cfg.clusters.len(),
        controllers = runner.controller_count(),
        period_ms = cfg.cycle.period_ms,
        "starting ESS power dispatch"
    );

    let mut ticker = interval(cfg.cycle.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut last_cycle: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let elapsed = last_cycle.map(|t| now - t);
                last_cycle = Some(now);
                if let Some(elapsed) = elapsed {
                    for ess in &simulated {
                        ess.advance(elapsed);
                    }
                }

                match runner.run_cycle(&mut power, elapsed) {
                    Ok(report) => {
                        for dispatch in report.groups.iter().flat_map(|g| g.dispatched.iter()) {
                            debug!(
                                cycle = report.cycle,
                                ess = %dispatch.ess,
                                active = dispatch.setpoint.active(),
                                reactive = dispatch.setpoint.reactive(),
                                soc = ?power.soc(&dispatch.ess),
                                "dispatched"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "cycle failed"),
                }
            }
        }
    }

    // Leave every device at zero power.
    match power.begin_cycle() {
        Ok(()) => {
            let report = power.apply_power();
            info!(cycle = report.cycle, "devices released at zero power");
        }
        Err(e) => warn!(error = %e, "unable to release devices"),
    }

    warn!("shutdown complete");
    Ok(())
}
