use anyhow::{anyhow, Context, Result};
use clap::{arg, Command};
use ift_core::{
    generate_splits, load_checkpoint, FileCheckpointSink, HyperClassifier, JsonLinesSink, Splits,
    Trainer,
};
use ift_structs::config::TrainConfig;
use ift_utils::{derive_seed, jsonify, load_json_arg};
use log::info;
use std::{fs, path::PathBuf};

fn cli() -> Command {
    Command::new("ift-runtime")
        .about("Trains a classifier jointly with its augmentation and reweighting hyperparameters")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("train")
                .about("Fine-tunes a model, tuning hyperparameters with implicit gradients")
                .arg(
                    arg!(<CONFIG> "Config json string or path to json file")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(--output [OUTPUT_DIR] "Directory under which a folder for this run is created")
                        .default_value("finetuned_checkpoints")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--resume [CHECKPOINT] "Resume from a fine-tuning checkpoint file or directory")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--baseline [CHECKPOINT] "Start from the classifier of a baseline checkpoint")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("evaluate")
                .about("Reports validation and test loss/accuracy of a checkpoint")
                .arg(
                    arg!(<CONFIG> "Config json string or path to json file")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(<CHECKPOINT> "Checkpoint file or directory")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(Command::new("default_config").about("Prints the default config as json"))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = cli().get_matches();

    if let Err(e) = match matches.subcommand() {
        Some(("train", sub_m)) => train(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            sub_m.get_one::<PathBuf>("output").unwrap().clone(),
            sub_m.get_one::<PathBuf>("resume").cloned(),
            sub_m.get_one::<PathBuf>("baseline").cloned(),
        ),
        Some(("evaluate", sub_m)) => evaluate(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            sub_m.get_one::<PathBuf>("CHECKPOINT").unwrap().clone(),
        ),
        Some(("default_config", _)) => default_config(),
        _ => Err(anyhow!("Invalid subcommand")),
    } {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn setup(config: &TrainConfig) -> Result<(Trainer<HyperClassifier>, Splits)> {
    let seed = config.calc_seed();
    let splits = generate_splits(
        &config.dataset,
        config.batch_size,
        derive_seed(&seed, "data"),
    )?;
    let model = HyperClassifier::from_config(config, derive_seed(&seed, "model"))?;
    let trainer = Trainer::new(model, config)?;
    Ok((trainer, splits))
}

pub fn train(
    config: String,
    output_dir: PathBuf,
    resume: Option<PathBuf>,
    baseline: Option<PathBuf>,
) -> Result<()> {
    let config: TrainConfig = load_json_arg(&config)?;
    let (mut trainer, mut splits) = setup(&config)?;

    if let Some(path) = baseline {
        trainer.load_baseline(&load_checkpoint(&path)?)?;
    }
    if let Some(path) = resume {
        trainer.resume(&load_checkpoint(&path)?)?;
    }

    let run_dir = output_dir.join(config.run_id());
    fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create directory {}", run_dir.display()))?;
    fs::write(run_dir.join("config.json"), jsonify(&config)?)
        .with_context(|| format!("Failed to write config to {}", run_dir.display()))?;
    info!(
        "Run {}: tuning hyperparameters every {} batches",
        config.run_id(),
        trainer.num_tune_hyper()
    );

    let mut checkpoints = FileCheckpointSink::new(&run_dir);
    let mut metrics = JsonLinesSink::create(&run_dir.join("metrics.jsonl"))?;
    let rows = trainer.run(&mut splits, &mut checkpoints, &mut metrics)?;
    if let Some(last) = rows.last() {
        println!("{}", jsonify(last)?);
    }
    Ok(())
}

pub fn evaluate(config: String, checkpoint: PathBuf) -> Result<()> {
    let config: TrainConfig = load_json_arg(&config)?;
    let (mut trainer, splits) = setup(&config)?;
    trainer.resume(&load_checkpoint(&checkpoint)?)?;
    let report = trainer.report(&splits)?;
    println!("{}", jsonify(&report)?);
    Ok(())
}

pub fn default_config() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&TrainConfig::default())?);
    Ok(())
}
