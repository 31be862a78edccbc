//! 포지션/주문 라이프사이클 엔진 CLI.
//!
//! # 사용 예시
//!
//! ```bash
//! # 재생 파일 백테스트
//! trader backtest -c config/default.toml -r demos/replay.jsonl --out-dir out/run-1
//!
//! # 모의투자 (시그널은 표준 입력 JSON lines)
//! signal-generator | trader paper -c config/default.toml
//!
//! # 실거래
//! trader live -c config/live.toml
//!
//! # 설정 검증
//! trader check-config -c config/default.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};

use trader_cli::commands::{backtest, run};
use trader_cli::AppConfig;
use trader_core::{init_logging, ExecutionMode, LogConfig};

#[derive(Parser)]
#[command(name = "trader")]
#[command(about = "Position & order lifecycle engine - Binance USDT-M 선물", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 재생 파일(JSON lines)로 백테스트
    Backtest {
        /// 설정 파일 경로
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// 재생 파일 경로 (틱/시그널 JSON lines)
        #[arg(short, long)]
        replay: PathBuf,

        /// 거래 로그/자산 곡선 출력 디렉터리
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// 시뮬레이션 거래소로 모의투자
    Paper {
        /// 설정 파일 경로
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 실거래
    Live {
        /// 설정 파일 경로
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 설정 검증 후 적용될 설정 출력
    CheckConfig {
        /// 설정 파일 경로
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Commands {
    fn config_path(&self) -> Option<&PathBuf> {
        match self {
            Commands::Backtest { config, .. }
            | Commands::Paper { config }
            | Commands::Live { config }
            | Commands::CheckConfig { config } => config.as_ref(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.command.config_path().map(PathBuf::as_path))
        .context("failed to load configuration")?;
    init_logging(LogConfig::from_settings(&config.logging))
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Backtest { replay, out_dir, .. } => {
            match backtest::run_backtest(&config, &replay, out_dir.as_deref()).await {
                Ok(summary) => {
                    backtest::print_summary(&summary);
                    if let Some(out) = out_dir {
                        println!("\n📁 결과 저장됨: {}", out.display());
                    }
                }
                Err(e) => {
                    error!("Backtest failed: {:#}", e);
                    return Err(e);
                }
            }
        }

        Commands::Paper { .. } => {
            let summary = run::run_trading(&config, ExecutionMode::Paper).await?;
            info!("Paper trading stopped");
            println!("{}", summary);
        }

        Commands::Live { .. } => {
            let summary = run::run_trading(&config, ExecutionMode::Live).await?;
            info!("Live trading stopped");
            println!("{}", summary);
        }

        Commands::CheckConfig { .. } => {
            println!("✅ 설정 검증 완료\n");
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
