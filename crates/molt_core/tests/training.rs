use molt_core::integrator::{solve, IntegratorConfig, TimeSpan};
use molt_core::loss::SquaredError;
use molt_core::models::LotkaVolterra;
use molt_core::nn::{Activation, Mlp, MlpConfig, NeuralOde};
use molt_core::optimizer::OptimizerConfig;
use molt_core::trainer::{
    Control, Trainer, TrainerConfig, TrainerState, TrainingFailure, TrainingStatus,
};

fn config() -> IntegratorConfig {
    IntegratorConfig::default().with_tolerances(1e-9, 1e-7)
}

fn lotka_volterra_data() -> SquaredError {
    let model = LotkaVolterra.lifted();
    let truth = solve(
        &model,
        &[1.5, 1.0, 1.0, 3.0],
        &[1.0, 1.0],
        TimeSpan::new(0.0, 4.0),
        &config(),
    )
    .expect("reference");
    let times = (1..=16).map(|i| 0.25 * i as f64).collect();
    SquaredError::from_trajectory(&truth, times).expect("loss")
}

#[test]
fn lotka_volterra_parameters_are_recovered() {
    let model = LotkaVolterra.lifted();
    let loss = lotka_volterra_data();
    let report = Trainer::new(&model, &loss, vec![1.0, 1.0], TimeSpan::new(0.0, 4.0))
        .with_integrator(config())
        .with_optimizer(OptimizerConfig::adam(0.02))
        .with_config(
            TrainerConfig::default()
                .with_max_iters(150)
                .with_loss_tol(1e-10)
                .with_switch_after(20)
                .with_plateau(1e-2, 5),
        )
        .fit(&[1.3, 0.9, 1.1, 2.8])
        .expect("train");

    assert!(!report.status.is_failure(), "{:?}", report.status);
    let first = report.loss_history[0];
    let last = report.final_loss().expect("history");
    assert!(last < 1e-3 * first, "loss {first} -> {last}");
    assert!(report.optimizer_switched_at.is_some());
    for (fitted, truth) in report.params.iter().zip([1.5, 1.0, 1.0, 3.0]) {
        assert!((fitted - truth).abs() < 0.05, "{:?}", report.params);
    }
}

#[test]
fn neural_ode_training_reduces_loss() {
    let mlp = Mlp::new(MlpConfig {
        layers: vec![2, 8, 2],
        activation: Activation::Tanh,
        output_activation: Activation::Identity,
        seed: 5,
        init_scale: 0.5,
    })
    .expect("mlp");
    let ode = NeuralOde::new(mlp).expect("neural ode");
    // Targets sampled from a slowly decaying rotation.
    let times: Vec<f64> = (1..=8).map(|i| 0.25 * i as f64).collect();
    let rows = times
        .iter()
        .map(|&t| vec![(-0.1 * t).exp() * t.cos(), (-0.1 * t).exp() * t.sin()])
        .collect();
    let loss = SquaredError::new(times, rows, vec![0, 1]).expect("loss");

    let mut observed = Vec::new();
    let mut observer = |iteration: usize, params: &[f64], loss: f64| {
        assert!(params.iter().all(|p| p.is_finite()));
        observed.push((iteration, loss));
        Control::Continue
    };
    let report = Trainer::new(&ode, &loss, vec![1.0, 0.0], TimeSpan::new(0.0, 2.0))
        .with_integrator(config())
        .with_optimizer(OptimizerConfig::adam(0.02))
        .with_config(TrainerConfig::default().with_max_iters(60))
        .run(&ode.init_params(), &mut observer)
        .expect("train");

    assert_eq!(
        report.status,
        TrainingStatus::Converged(molt_core::trainer::ConvergenceReason::MaxIterations)
    );
    assert_eq!(report.iterations, 60);
    assert_eq!(observed.len(), 61);
    assert_eq!(report.loss_history.len(), 61);
    assert!(report.loss_history[60] < 0.7 * report.loss_history[0]);
}

#[test]
fn relu_network_on_its_kink_halts_training() {
    let mlp = Mlp::new(MlpConfig {
        layers: vec![2, 4, 2],
        activation: Activation::Relu,
        init_scale: 0.0,
        ..MlpConfig::default()
    })
    .expect("mlp");
    let ode = NeuralOde::new(mlp).expect("neural ode");
    let loss = SquaredError::new(vec![1.0], vec![vec![0.5, 0.5]], vec![0, 1]).expect("loss");
    let initial = ode.init_params();
    let report = Trainer::new(&ode, &loss, vec![1.0, 0.0], TimeSpan::new(0.0, 1.0))
        .fit(&initial)
        .expect("train");

    assert_eq!(report.final_state, TrainerState::Failed);
    match &report.status {
        TrainingStatus::Failed(TrainingFailure::Differentiation { iteration, params }) => {
            assert_eq!(*iteration, 0);
            assert!(!params.is_empty());
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(report.params, initial);
    assert_eq!(report.loss_history.len(), 1);
}

#[test]
fn training_report_serializes() {
    let model = LotkaVolterra.lifted();
    let loss = lotka_volterra_data();
    let report = Trainer::new(&model, &loss, vec![1.0, 1.0], TimeSpan::new(0.0, 4.0))
        .with_config(TrainerConfig::default().with_max_iters(2))
        .fit(&[1.3, 0.9, 1.1, 2.8])
        .expect("train");
    let json = serde_json::to_string(&report).expect("serialize");
    assert!(json.contains("MaxIterations"));
}
