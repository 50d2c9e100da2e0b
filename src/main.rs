use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use algtest_monitor::app::{replay, Config, ControlLoop, HeadlessIntents, TerminalIntents};
use algtest_monitor::process::ExitInfo;
use algtest_monitor::ui::ConsoleSink;

/// Algtest Monitor - progress display for the TPM algorithm test tool
#[derive(Parser)]
#[command(name = "algtest-monitor")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); defaults to the config value
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Config file (defaults to ~/.config/algtest-monitor/config.toml)
    #[arg(short, long, global = true, env = "ALGTEST_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test tool and show its progress (default)
    Run {
        /// Command line to run instead of the configured one
        #[arg(long)]
        command: Option<String>,
        /// No keyboard: start immediately and exit when the test ends
        #[arg(long)]
        headless: bool,
    },
    /// Feed captured test output through the progress parser
    Replay {
        /// Captured output file, or `-` for stdin
        input: PathBuf,
    },
    /// Show the config file path and the effective configuration
    Config,
}

const KEY_HELP: &str = "r/Enter: start  s: stop  q: quit  Esc/Ctrl-C: cancel";

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // 設定を先に読み込む（ファイルがなければ作成）
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // ログ初期化
    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    init_logging(&level)?;

    match cli.command {
        Some(Commands::Run { command, headless }) => {
            if let Some(command) = command {
                config.monitor.command = command;
            }
            if headless {
                run_headless(config)
            } else {
                run_interactive(config)
            }
        }
        None => run_interactive(config),
        Some(Commands::Replay { input }) => run_replay(&config, &input),
        Some(Commands::Config) => show_config(&cli.config, &config),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let log_dir = directories::ProjectDirs::from("", "", "algtest-monitor")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("algtest-monitor"));

    std::fs::create_dir_all(&log_dir)?;
    let log_file = std::fs::File::create(log_dir.join("algtest-monitor.log"))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(log_file))
        .init();

    info!("Algtest Monitor starting");
    Ok(())
}

fn run_interactive(config: Config) -> Result<ExitCode> {
    println!("{}", KEY_HELP);

    enable_raw_mode()?;
    let sink = ConsoleSink::new(io::stdout()).raw_mode();
    let mut control = ControlLoop::from_config(&config.monitor, sink);

    let result = control.run(&mut TerminalIntents::new());

    // 子プロセスを確実に止めてから端末を戻す
    control.shutdown();
    let finish = control.sink_mut().finish();
    disable_raw_mode()?;

    result?;
    finish?;
    Ok(ExitCode::SUCCESS)
}

fn run_headless(mut config: Config) -> Result<ExitCode> {
    config.monitor.exit_when_done = true;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    let mut control = ControlLoop::from_config(&config.monitor, ConsoleSink::new(io::stdout()));
    control
        .run(&mut HeadlessIntents::new(cancel))
        .context("Test run failed")?;
    control.sink_mut().finish()?;

    let code = match control.last_exit() {
        Some(ExitInfo::Exited(status)) => exit_code(status.code()),
        // 中断（SIGINT 相当）
        Some(ExitInfo::Stopped) | None => ExitCode::from(130),
        Some(ExitInfo::Unknown) => ExitCode::FAILURE,
    };
    Ok(code)
}

fn exit_code(code: Option<i32>) -> ExitCode {
    match code.and_then(|c| u8::try_from(c).ok()) {
        Some(c) => ExitCode::from(c),
        None => ExitCode::FAILURE,
    }
}

fn run_replay(config: &Config, input: &Path) -> Result<ExitCode> {
    let mut sink = ConsoleSink::new(io::stdout());
    let model = if input == Path::new("-") {
        replay(io::stdin().lock(), &config.monitor, &mut sink)?
    } else {
        let file = std::fs::File::open(input)
            .with_context(|| format!("Failed to open {}", input.display()))?;
        replay(file, &config.monitor, &mut sink)?
    };
    sink.finish()?;

    info!(
        "Replay finished: overall {}, test {}, {} log lines",
        model.primary(),
        model.secondary(),
        model.log().len()
    );
    Ok(ExitCode::SUCCESS)
}

fn show_config(path: &Option<PathBuf>, config: &Config) -> Result<ExitCode> {
    let path = match path {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "# {}", path.display())?;
    write!(stdout, "{}", config.to_toml()?)?;
    Ok(ExitCode::SUCCESS)
}
