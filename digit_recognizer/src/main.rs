use clap::Parser;
use digit_recognizer::{config, start_app};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "digit_recognizer")]
#[command(about = "Serves handwritten digit predictions from a pre-trained model")]
struct CliArgs {
    /// Saved model path
    #[arg(long, alias = "model_path")]
    model_path: PathBuf,

    /// Directory holding base.yaml and the per-environment overrides
    #[arg(long, default_value = "configuration")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config = config::get_configuration(&args.config_dir, &args.model_path)?;
    let log_level = &format!("{},ort=info", config.log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();

    start_app(config).await?;

    Ok(())
}
