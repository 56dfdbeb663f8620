//! Trains a feed-forward classifier on MNIST or Fashion-MNIST using the
//! library provided by `mnist_train`
//!
//! # Usage
//! Expects the uncompressed IDX files under `<data-dir>/<dataset>/`. Runnable via
//! ```sh
//! cargo run --release -- -h
//! cargo run --release -- --dataset fashion-mnist --optimizer adam --hidden 256,128,64 --dropout 0.2 --epochs 30 --validate
//! ```

use std::{error::Error, fs, path::PathBuf};

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

use mnist_train::{
    datasets::{Dataset, Normalize, load_dataset},
    eval::predict_proba,
    loss::NLLLoss,
    nn::{Model, Sequential},
    optim::{Adam, Optim, SGD},
    report,
    train::{TrainConfig, Trainer},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OptimizerKind {
    Sgd,
    Adam,
}

#[derive(Parser)]
struct Args {
    #[clap(short, long, value_enum, default_value_t = Dataset::Mnist)]
    dataset: Dataset,
    #[clap(long, default_value = "data")]
    data_dir: PathBuf,
    #[clap(short, long, default_value_t = 64)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 5)]
    epochs: usize,
    #[clap(short, long, default_value_t = 0.003)]
    lr: f32,
    #[clap(long, value_enum, default_value_t = OptimizerKind::Sgd)]
    optimizer: OptimizerKind,
    /// Only used by SGD
    #[clap(short, long, default_value_t = 0.0)]
    momentum: f32,
    #[clap(long, value_delimiter = ',', default_values_t = vec![128, 64])]
    hidden: Vec<usize>,
    /// Probability of dropping a hidden activation while training
    #[clap(long, default_value_t = 0.0)]
    dropout: f32,
    /// Evaluate on the test split after every epoch
    #[clap(long, default_value_t = false)]
    validate: bool,
    #[clap(short, long, default_value_t = 1)]
    print_epochs: usize,
    #[clap(long)]
    seed: Option<u64>,
    #[clap(short, long, default_value_t = format!("output"))]
    output_dir: String,
    /// Save the loss curve(s) as a PNG in `output_dir`
    #[clap(long, default_value_t = false)]
    plot: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut rng = match args.seed {
        Some(seed) => Pcg64Mcg::seed_from_u64(seed),
        None => Pcg64Mcg::from_rng(&mut rand::rng()),
    };

    let splits = load_dataset(args.dataset, &args.data_dir, Normalize::default())?;
    let n_features = splits.train.n_features();
    let sample = splits
        .test
        .images
        .rows()
        .into_iter()
        .next()
        .map(|row| row.to_owned())
        .zip(splits.test.labels.first().copied());
    let train_loader = splits.train.into_loader(args.batch_size, true)?;
    let test_loader = splits.test.into_loader(args.batch_size, false)?;
    log::info!(
        "{}: {} training batches of {}, {} test samples",
        args.dataset,
        train_loader.len(),
        train_loader.batch_size(),
        test_loader.n_samples()
    );

    let model = Sequential::classifier(
        n_features,
        &args.hidden,
        args.dataset.n_classes(),
        args.dropout,
        &mut rng,
    )?;
    log::info!("model: {}", model.layer_names().join(" -> "));
    let optim: Box<dyn Optim> = match args.optimizer {
        OptimizerKind::Sgd => Box::new(SGD::new(&model.parameters(), args.lr, args.momentum)),
        OptimizerKind::Adam => Box::new(Adam::new(&model.parameters(), args.lr)),
    };
    log::info!("optimizer: {:?}, lr {}", args.optimizer, optim.lr());

    let mut trainer = Trainer::new(model, NLLLoss, optim);
    let config = TrainConfig {
        epochs: args.epochs,
        log_every: args.print_epochs,
    };
    let validation = args.validate.then_some(&test_loader);
    let history = trainer.fit(&train_loader, validation, &config, &mut rng)?;

    let test_stats = trainer.evaluate(&test_loader)?;
    log::info!(
        "test loss: {:.3}, test accuracy: {:.3} ({}/{})",
        test_stats.loss,
        test_stats.accuracy(),
        test_stats.correct,
        test_stats.total
    );

    let (mut model, _, _) = trainer.into_parts();
    if let Some((image, label)) = sample {
        let probs = predict_proba(&mut model, image.view())?;
        let class_names = args.dataset.class_names();
        log::info!(
            "class probabilities for a '{}' test image:\n{}",
            class_names[label],
            report::class_probabilities(probs.as_slice().unwrap_or(&[]), class_names)
        );
    }

    if args.plot {
        fs::create_dir_all(&args.output_dir)?;
        report::plot_losses(
            &history,
            &format!("{}/losses_{}.png", args.output_dir, args.dataset),
        )?;
    }
    Ok(())
}
