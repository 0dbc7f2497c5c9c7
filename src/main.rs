use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use upscale_bot::api::server::{serve, AppState};
use upscale_bot::commands::CommandHandler;
use upscale_bot::models::ModelRegistry;
use upscale_bot::pipeline::acquire::HttpImageFetcher;
use upscale_bot::pipeline::delivery::WebhookReplyChannel;
use upscale_bot::pipeline::execution::default_upscale_pipeline;
use upscale_bot::pipeline::runtime::default_app_root_from_manifest_dir;
use upscale_bot::settings_layer::{load_bot_settings, BotSettings};
use upscale_bot::worker::UpscaleQueue;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = parse_cli_args(std::env::args().skip(1).collect::<Vec<_>>().as_slice())?;
    match cli.command {
        CliCommand::Help => {
            print_usage();
            Ok(())
        }
        CliCommand::ValidateSettings => run_validate_settings_cli(cli.settings_path.as_deref()),
        CliCommand::Models => run_models_cli(cli.settings_path.as_deref()).await,
        CliCommand::Serve => run_serve(cli.settings_path.as_deref()).await,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliCommand {
    Serve,
    ValidateSettings,
    Models,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    command: CliCommand,
    settings_path: Option<String>,
}

fn parse_cli_args(args: &[String]) -> Result<CliArgs, Box<dyn std::error::Error>> {
    let mut command = None::<CliCommand>;
    let mut settings_path = None::<String>;

    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-h" | "--help" => {
                return Ok(CliArgs {
                    command: CliCommand::Help,
                    settings_path,
                });
            }
            "--settings" => {
                let Some(value) = args.get(i + 1) else {
                    return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
                };
                settings_path = Some(value.clone());
                i += 2;
            }
            "serve" | "validate-settings" | "models" if command.is_none() => {
                command = Some(match flag {
                    "validate-settings" => CliCommand::ValidateSettings,
                    "models" => CliCommand::Models,
                    _ => CliCommand::Serve,
                });
                i += 1;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    Ok(CliArgs {
        command: command.unwrap_or(CliCommand::Serve),
        settings_path,
    })
}

fn load_settings(explicit_path: Option<&str>) -> Result<BotSettings, Box<dyn std::error::Error>> {
    let app_root = default_app_root_from_manifest_dir();
    Ok(load_bot_settings(app_root.as_path(), explicit_path)?)
}

fn run_validate_settings_cli(explicit_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(explicit_path)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "settings": settings,
        }))?
    );
    Ok(())
}

async fn run_models_cli(explicit_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(explicit_path)?;
    let registry = ModelRegistry::from_dir(settings.model_dir()).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "model_dir": registry.dir(),
            "models": registry.names(),
        }))?
    );
    Ok(())
}

async fn run_serve(explicit_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(explicit_path)?;
    info!(
        prefix = %settings.command_prefix,
        esrgan_root = %settings.esrgan_root.display(),
        pixel_limit = settings.pixel_limit,
        max_upload_bytes = settings.max_upload_bytes,
        "settings loaded"
    );

    let workspace = settings.workspace();
    workspace.prepare().await?;
    workspace.empty_dirs().await?;

    let registry = Arc::new(ModelRegistry::from_dir(settings.model_dir()).await?);
    let pipeline = default_upscale_pipeline(&settings)?;
    let queue = UpscaleQueue::new(
        Arc::new(pipeline),
        workspace,
        Arc::new(WebhookReplyChannel::default()),
    );
    let model_fetcher = HttpImageFetcher::new(None)?;
    let commands = Arc::new(CommandHandler::new(
        settings.command_prefix.as_str(),
        registry,
        queue.clone(),
        Arc::new(model_fetcher),
    ));

    let addr: SocketAddr = settings.bind.parse()?;
    serve(addr, AppState::new(commands, queue)).await?;
    Ok(())
}

fn print_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  upscale-bot [serve] [--settings PATH]\n",
        "  upscale-bot validate-settings [--settings PATH]\n",
        "  upscale-bot models [--settings PATH]\n\n",
        "Defaults:\n",
        "  settings file: config/bot.settings.toml (JSON accepted when the path ends in .json)\n",
        "  UPSCALE_BOT_* environment variables override the settings file\n"
    ));
}
