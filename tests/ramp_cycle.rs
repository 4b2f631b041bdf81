//! Ramp limiter driven through full engine cycles: the ramp output becomes an
//! EQ constraint, the LP solves it and the simulated ESS reports it back as
//! its measured power for the next cycle.

use ess_power::controller::{RampConfig, RampLimiter};
use ess_power::domain::{EssRef, SimulatedEss};
use ess_power::EssPower;
use std::sync::Arc;

struct Rig {
    ess: Arc<SimulatedEss>,
    power: EssPower,
    ramp: RampLimiter,
}

impl Rig {
    fn new(ess: SimulatedEss) -> Self {
        let ess = Arc::new(ess);
        let power = EssPower::builder()
            .add_ess(ess.clone() as EssRef)
            .build()
            .unwrap();
        Self {
            ess,
            power,
            ramp: RampLimiter::new(&RampConfig::default()),
        }
    }

    fn cycle(&mut self, target: i32) -> i32 {
        self.power.begin_cycle().unwrap();
        self.ramp.accept(&mut self.power, "ess0", target, None).unwrap();
        let report = self.power.apply_power();
        assert!(!report.is_degraded());
        report.dispatch_for("ess0").unwrap().setpoint.active()
    }

    fn run(&mut self, target: i32, expected: &[i32]) {
        let actual: Vec<i32> = expected.iter().map(|_| self.cycle(target)).collect();
        assert_eq!(actual, expected, "ramp towards {target}");
    }
}

fn then_constant(head: &[i32], value: i32, count: usize) -> Vec<i32> {
    let mut v = head.to_vec();
    v.extend(std::iter::repeat(value).take(count));
    v
}

#[test]
fn test_ramp_with_sign_reversals() {
    let mut rig = Rig::new(SimulatedEss::symmetric("ess0", -100_000, 100_000));

    rig.run(
        10_000,
        &then_constant(
            &[
                3000, 4800, 6480, 7548, 8345, 8868, 9235, 9481, 9648, 9762, 9839, 9891, 9926, 9950, 9966, 9977,
                9984, 9989, 9993, 9995, 9997, 9998, 9998, 9999, 9999,
            ],
            10_000,
            9,
        ),
    );
    rig.run(
        -10_000,
        &then_constant(
            &[
                4000, 400, -2960, -5096, -6690, -7737, -8471, -8961, -9297, -9523, -9677, -9781, -9852, -9900,
                -9932, -9954, -9969, -9979, -9986, -9990, -9993, -9996, -9997, -9998, -9999, -9999, -9999,
            ],
            -10_000,
            12,
        ),
    );
    rig.run(
        10_000,
        &then_constant(
            &[
                -3999, -400, 2960, 5096, 6690, 7737, 8471, 8961, 9297, 9523, 9677, 9781, 9852, 9900, 9932, 9954,
                9969, 9979, 9985, 9990, 9993, 9996, 9997, 9998, 9999, 9999, 9999,
            ],
            10_000,
            12,
        ),
    );
    rig.run(
        0,
        &then_constant(
            &[
                7000, 5200, 3520, 2452, 1655, 1131, 765, 519, 352, 238, 161, 109, 74, 50, 34, 23, 16, 11, 7, 5, 3,
                2, 2, 1, 1,
            ],
            0,
            9,
        ),
    );
}

#[test]
fn test_ramp_from_full_discharge_to_zero() {
    let mut rig = Rig::new(SimulatedEss::symmetric("ess0", -100_000, 100_000));
    rig.ess.set_measured_active_power(100_000);

    rig.run(100_000, &[100_000]);
    rig.run(0, &[0; 7]);
}

#[test]
fn test_ramp_from_full_charge_to_zero() {
    let mut rig = Rig::new(SimulatedEss::symmetric("ess0", -100_000, 100_000));
    rig.ess.set_measured_active_power(-100_000);

    rig.run(-100_000, &[-100_000]);
    rig.run(0, &[0; 7]);
}

#[test]
fn test_ramp_degenerate_envelope() {
    let mut rig = Rig::new(SimulatedEss::symmetric("ess0", -100_000, 100_000));
    rig.ess.set_active_limits(5, 4);

    for target in [-100_000, 0, 5, 0] {
        rig.run(target, &[5]);
    }
}

#[test]
fn test_ramp_inside_charge_only_envelope() {
    let mut rig = Rig::new(SimulatedEss::symmetric("ess0", -100_000, 100_000));
    rig.ess.set_active_limits(-1000, -500);

    rig.run(-2000, &[-500]);
    rig.run(
        -100_000,
        &[
            -500, -600, -710, -796, -860, -904, -935, -955, -970, -979, -986, -991, -994, -996, -997, -998, -999,
            -999, -999, -1000,
        ],
    );
    rig.run(
        0,
        &[
            -849, -760, -676, -622, -583, -556, -538, -526, -518, -512, -508, -506, -504, -502, -502, -501, -501,
            -500, -500, -500, -500,
        ],
    );
    rig.run(100_000, &[-500]);
}

#[test]
fn test_ramp_on_cluster() {
    let ess0 = Arc::new(SimulatedEss::symmetric("ess0", -5000, 5000));
    let ess1 = Arc::new(SimulatedEss::symmetric("ess1", -5000, 5000));
    let cluster = ess_power::domain::EssCluster::new("cluster0", vec!["ess0".into(), "ess1".into()]).unwrap();
    let mut power = EssPower::builder()
        .add_ess(ess0.clone() as EssRef)
        .add_ess(ess1.clone() as EssRef)
        .add_cluster(cluster)
        .build()
        .unwrap();
    let mut ramp = RampLimiter::new(&RampConfig::default());

    power.begin_cycle().unwrap();
    let constraint = ramp.accept(&mut power, "cluster0", 10_000, None).unwrap();
    assert_eq!(constraint.value(), 3000.0);
    let report = power.apply_power();

    let total: i32 = ["ess0", "ess1"]
        .iter()
        .map(|id| report.dispatch_for(id).unwrap().setpoint.active())
        .sum();
    assert_eq!(total, 3000);
    assert_eq!(ramp.last_output(), Some(3000));
}
