use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use dynotype::model::{ReactionNetwork, ReactionSpec};
use dynotype::patient::PatientSpec;
use dynotype::personalize::personalize;
use dynotype::simulator::{simulate, SolverMethod, SolverOptions, TimeGrid};

fn signaling_model() -> ReactionNetwork {
    ReactionNetwork::builder()
        .species("R", 1.0)
        .species("R_p", 0.0)
        .species("E", 0.5)
        .species("E_p", 0.0)
        .parameter("k_stim", 2.0)
        .parameter("k_r_deph", 0.4)
        .parameter("v_cascade", 1.5)
        .parameter("km_cascade", 0.3)
        .parameter("k_e_deph", 0.6)
        .reaction(
            ReactionSpec::mass_action("receptor_activation", "k_stim")
                .reactant("R")
                .product("R_p"),
        )
        .reaction(
            ReactionSpec::mass_action("receptor_deactivation", "k_r_deph")
                .reactant("R_p")
                .product("R"),
        )
        .reaction(
            ReactionSpec::michaelis_menten("cascade", "v_cascade", "km_cascade", "E")
                .reactant("E")
                .product("E_p"),
        )
        .reaction(
            ReactionSpec::mass_action("effector_deactivation", "k_e_deph")
                .reactant("E_p")
                .product("E"),
        )
        .build()
        .unwrap()
}

fn bench_simulate(c: &mut Criterion) {
    let network = signaling_model();
    let params = personalize(&network, &PatientSpec::new("bench")).unwrap();
    let grid = TimeGrid::new(0.0, 20.0, 201);

    let mut group = c.benchmark_group("simulate");
    for (name, method) in [
        ("rk4_fixed", SolverMethod::FixedRk4 { dt: 0.01 }),
        ("dormand_prince", SolverMethod::DormandPrince),
        ("sdirk", SolverMethod::Sdirk),
    ] {
        let options = SolverOptions::default().with_method(method);
        group.bench_with_input(BenchmarkId::from_parameter(name), &options, |b, options| {
            b.iter(|| simulate(&network, &params, &grid, options));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_simulate);
criterion_main!(benches);
