use ndarray::{arr2, concatenate, Axis};
use strata::layers::DenseLayer;
use strata::{ActivationType, FitConfig, Loss, NetworkBuilder, Optimizer, OptimizerConfig};

fn main() -> strata::Result<()> {
    tracing_subscriber::fmt().init();

    let x = arr2(&[[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]]);
    let y = arr2(&[[1.0, 0.0], [0.0, 1.0], [0.0, 1.0], [1.0, 0.0]]);

    // repeat the truth table so one epoch holds enough batches
    let train_x = concatenate(Axis(0), &vec![x.view(); 250])
        .map_err(|e| strata::Error::Shape(e.to_string()))?
        .into_dyn();
    let train_y = concatenate(Axis(0), &vec![y.view(); 250])
        .map_err(|e| strata::Error::Shape(e.to_string()))?
        .into_dyn();

    let mut network = NetworkBuilder::new(&[2])
        .with_seed(42)
        .add(DenseLayer::new(12, ActivationType::Sigmoid))
        .add(DenseLayer::new(2, ActivationType::Sigmoid))
        .finalize(Loss::BinaryCrossEntropy, Optimizer::new(OptimizerConfig::adam(0.08))?)?;

    network.fit(&train_x, &train_y, &FitConfig::new(30, 4), None)?;

    let x = x.into_dyn();
    let prediction = network.predict(&x)?;
    for (input, output) in x.outer_iter().zip(prediction.outer_iter()) {
        println!("{input} -> {output:.3}");
    }

    let evaluation = network.evaluate(&x, &y.into_dyn(), true)?;
    println!("cost {:.4}, accuracy {:?}", evaluation.cost, evaluation.accuracy);
    Ok(())
}
