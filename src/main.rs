use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use derma_ai_lib::dataset::organize;
use derma_ai_lib::ml::{load_classifier, train_model};
use derma_ai_lib::model::{load_metadata, print_metadata_info, AppConfig};
use derma_ai_lib::types::{Backbone, Split};
use derma_ai_lib::web::{start_web_server, AppState};

#[derive(Parser, Debug)]
#[command(
    name = "derma-ai",
    about = "Skin lesion classifier: dataset tooling, training and inference API",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    /// Path to the JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the inference HTTP server
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Packaged model (.tar.gz)
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Copy HAM10000 and extra disease images into train/val folders
    Organize {
        #[arg(long)]
        ham_dir: Option<PathBuf>,
        #[arg(long)]
        common_dir: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Do not delete the output directory first
        #[arg(long, default_value_t = false)]
        keep_existing: bool,
    },
    /// Train the classifier on an organized dataset
    Train {
        /// Directory containing train/ and val/
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Output model path (.tar.gz)
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// mobilenet_v2 or efficientnet_b1
        #[arg(long)]
        backbone: Option<Backbone>,
        /// torchvision ImageNet weights (.pth) for the base network
        #[arg(long)]
        weights: Option<String>,
    },
    /// Print the metadata of a packaged model
    Inspect {
        model: PathBuf,
    },
}

fn verbosity_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn try_init_tracing(verbosity: u8) -> Result<(), TryInitError> {
    // RUST_LOG が設定されていればそちらを優先
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_level(verbosity)));

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    // log クレート経由のログ（actix の Logger など）も同じ subscriber に流す
    subscriber.try_init()
}

fn init_tracing(verbosity: u8) {
    if let Err(e) = try_init_tracing(verbosity) {
        eprintln!("ログの初期化に失敗しました: {}", e);
    }
}

fn path_string(path: PathBuf) -> String {
    path.to_string_lossy().to_string()
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path);
    config.apply_env_overrides();

    match args.command {
        Commands::Serve { host, port, model } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(model) = model {
                config.set_model_path(path_string(model));
            }
            config.display();

            let classifier = match load_classifier(&config.model.model_path, config.device_type) {
                Ok(classifier) => Some(classifier),
                Err(e) => {
                    warn!(
                        "モデルを読み込めませんでした ({}): {:#}。/predict は利用できません",
                        config.model.model_path, e
                    );
                    None
                }
            };

            let state = AppState::new(classifier, config.server.clone());
            actix_web::rt::System::new()
                .block_on(start_web_server(state))
                .context("Web server failed")?;
        }
        Commands::Organize {
            ham_dir,
            common_dir,
            output,
            keep_existing,
        } => {
            let mut settings = config.dataset.clone();
            if let Some(dir) = ham_dir {
                settings.ham_dir = path_string(dir);
            }
            if let Some(dir) = common_dir {
                settings.common_dir = path_string(dir);
            }
            if let Some(dir) = output {
                settings.output_dir = path_string(dir);
            }
            if keep_existing {
                settings.clean_output = false;
            }

            let report = organize(&settings)?;
            for split in Split::ALL {
                info!("[{}] 合計 {} 枚", split, report.total(split));
                for (label, count) in report.counts(split) {
                    info!("  {}: {}", label, count);
                }
            }
            if report.missing_images > 0 {
                warn!("画像が見つからなかった行: {}", report.missing_images);
            }
        }
        Commands::Train {
            data_dir,
            output,
            epochs,
            batch_size,
            backbone,
            weights,
        } => {
            let mut settings = config.training.clone();
            if let Some(epochs) = epochs {
                settings.num_epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                settings.batch_size = batch_size;
            }
            if let Some(backbone) = backbone {
                settings.backbone = backbone;
            }
            if weights.is_some() {
                settings.pretrained_weights = weights;
            }

            let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(&config.dataset.output_dir));
            let output = output.unwrap_or_else(|| PathBuf::from(&config.model.model_path));

            let report = train_model(&settings, &data_dir, &output, config.device_type)?;
            info!(
                "学習完了: {} に保存しました (学習 {} 枚, 検証 {} 枚{})",
                report.output_path.display(),
                report.train_samples,
                report.val_samples,
                if report.dummy { ", ダミー" } else { "" }
            );
        }
        Commands::Inspect { model } => {
            let metadata = load_metadata(&model)?;
            print_metadata_info(&metadata);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity_level(0), "info");
        assert_eq!(verbosity_level(1), "debug");
        assert_eq!(verbosity_level(5), "trace");
    }

    #[test]
    fn test_second_init_reports_error() {
        let _ = try_init_tracing(0);
        assert!(try_init_tracing(1).is_err());
    }
}
