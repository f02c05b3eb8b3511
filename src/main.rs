use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;

use ollama_facade::{Application, ChatMessage, Config, Ollama, OllamaApi, OllamaServiceProvider};

#[derive(Parser, Debug)]
#[command(name = "ollama-facade")]
#[command(about = "OLLAMAクライアントをファサード経由で呼び出す")]
#[command(version)]
struct Args {
    /// 設定ファイルパス
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// OLLAMAサーバーURL
    #[arg(long)]
    ollama_url: Option<String>,

    /// 使用するモデル名
    #[arg(short, long)]
    model: Option<String>,

    /// 詳細ログを表示 (INFO level)
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// プロンプトからテキストを生成
    Generate {
        prompt: String,
        /// システムプロンプト
        #[arg(long)]
        system: Option<String>,
        /// トークン単位で表示
        #[arg(long)]
        stream: bool,
    },
    /// 1ターンのチャット
    Chat {
        message: String,
        /// システムプロンプト
        #[arg(long)]
        system: Option<String>,
    },
    /// インストール済みモデルの一覧
    Models,
    /// サーバーへの疎通確認
    Ping,
}

#[tokio::main]
async fn main() -> Result<()> {
    // トレーシング初期化（デフォルトはWARN、--verboseでINFO）
    let args = Args::parse();
    let default_level = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = load_config(&args)?;
    tracing::info!("ollama-facade v{} starting...", ollama_facade::VERSION);
    tracing::info!("OLLAMA URL: {}", config.ollama.url);
    tracing::info!("Model: {}", config.ollama.model);

    let mut app = Application::new(config);
    app.register(OllamaServiceProvider)?;
    app.boot()?;

    let ollama: Ollama = app.facade()?;
    run(&ollama, args.command).await
}

/// 設定ファイル → 環境変数 → コマンドライン引数の順に適用
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) if path.exists() => Config::load_from_file(path)?,
        Some(path) => {
            tracing::warn!("Config file not found: {}, using defaults", path.display());
            Config::default()
        }
        None => Config::load_default().unwrap_or_else(|e| {
            tracing::warn!("Failed to load default config: {}, using defaults", e);
            Config::default()
        }),
    };

    config.apply_env_overrides();
    if let Some(url) = &args.ollama_url {
        config.set("ollama.url", url)?;
    }
    if let Some(model) = &args.model {
        config.set("ollama.model", model)?;
    }
    Ok(config)
}

async fn run(ollama: &Ollama, command: Commands) -> Result<()> {
    match command {
        Commands::Generate {
            prompt,
            system,
            stream,
        } => {
            if stream {
                let mut response = ollama.generate_streaming(&prompt, system.as_deref()).await?;
                let mut stdout = std::io::stdout();
                while let Some(chunk) = response.next().await {
                    let chunk = chunk?;
                    print!("{}", chunk.text);
                    stdout.flush()?;
                    if let Some(stats) = chunk.stats {
                        tracing::info!(
                            eval_count = stats.eval_count,
                            tokens_per_second = stats.tokens_per_second,
                            "Generation finished"
                        );
                    }
                }
                println!();
            } else {
                let text = ollama.generate(&prompt, system.as_deref()).await?;
                println!("{}", text);
            }
        }
        Commands::Chat { message, system } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::system(system));
            }
            messages.push(ChatMessage::user(message));

            let reply = ollama.chat(&messages).await?;
            println!("{}", reply.content);
        }
        Commands::Models => {
            let models = ollama.list_models().await?;
            if models.is_empty() {
                println!("No models installed");
            }
            for model in models {
                match model.size {
                    Some(size) => println!("{}\t{:.1} GB", model.name, size as f64 / 1e9),
                    None => println!("{}", model.name),
                }
            }
        }
        Commands::Ping => {
            if !ollama.is_available().await {
                bail!("OLLAMA is not reachable at {}", ollama.base_url());
            }
            println!(
                "OLLAMA is reachable at {} (model: {})",
                ollama.base_url(),
                ollama.model()
            );
        }
    }
    Ok(())
}
