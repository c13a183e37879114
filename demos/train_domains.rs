/// Domain adaptation training from a JSON run configuration
///
/// Usage: cargo run --example train_domains -- run.json
use multisource_da::data::NumpyProvider;
use multisource_da::{training, TrainConfig};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading run configuration from {}", path);
            TrainConfig::from_json_file(&path)?
        }
        None => {
            log::info!("No configuration given, using defaults");
            TrainConfig::default()
        }
    };
    log::info!("Configuration: {:#?}", config);

    let provider = NumpyProvider::new(&config.data_dir, config.normalization()?);
    let report = training::run(&config, &provider)?;

    log::info!(
        "Best val-acc {:.4} at epoch {} ({} generator steps, {} discriminator steps)",
        report.best.acc,
        report.best.epoch,
        report.generator_steps,
        report.discriminator_steps
    );
    if let Some(last) = report.last_epoch() {
        log::info!("Final epoch summary: {}", serde_json::to_string(last)?);
    }

    Ok(())
}
