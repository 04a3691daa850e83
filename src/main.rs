use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use screenrec_lib::capture::{Rect, WindowHandle};
use screenrec_lib::config::RecorderConfig;
use screenrec_lib::encoder::VideoCodec;
use screenrec_lib::recorder::{CaptureMode, ManagerEvent, RecordingEvent, RecordingManager, RecordingOptions};
use std::path::PathBuf;
use std::time::Duration;

/// Record the screen, a window or a region to a video file.
#[derive(Parser, Debug)]
#[command(name = "screenrec", version)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: <config dir>/screenrec/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record until the duration elapses or Ctrl-C
    Record(RecordArgs),
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Screen,
    Window,
    Region,
}

impl From<ModeArg> for CaptureMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Screen => CaptureMode::Screen,
            ModeArg::Window => CaptureMode::Window,
            ModeArg::Region => CaptureMode::Region,
        }
    }
}

#[derive(Args, Debug)]
struct RecordArgs {
    #[arg(long, value_enum, default_value = "screen")]
    mode: ModeArg,

    /// Window handle, decimal or 0x-prefixed hex
    #[arg(long, value_parser = parse_window)]
    window: Option<WindowHandle>,

    /// Region as x,y,width,height
    #[arg(long, value_parser = parse_region)]
    region: Option<Rect>,

    #[arg(long)]
    fps: Option<u32>,

    /// Bitrate in kbps
    #[arg(long)]
    bitrate: Option<u32>,

    /// h264, hevc, vp9 or av1
    #[arg(long)]
    codec: Option<VideoCodec>,

    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Record through the ffmpeg process
    #[arg(long)]
    ffmpeg: bool,

    #[arg(long)]
    no_cursor: bool,

    /// Flip frames vertically before encoding
    #[arg(long)]
    flip: bool,
}

fn parse_window(s: &str) -> Result<WindowHandle, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed
        .map(WindowHandle)
        .map_err(|e| format!("invalid window handle '{}': {}", s, e))
}

fn parse_region(s: &str) -> Result<Rect, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [x, y, w, h] = parts.as_slice() else {
        return Err(format!("expected x,y,width,height, got '{}'", s));
    };
    let num = |v: &str| v.parse::<i64>().map_err(|e| format!("'{}': {}", v, e));
    let (x, y, w, h) = (num(x)?, num(y)?, num(w)?, num(h)?);
    Ok(Rect::new(
        i32::try_from(x).map_err(|e| e.to_string())?,
        i32::try_from(y).map_err(|e| e.to_string())?,
        u32::try_from(w).map_err(|e| e.to_string())?,
        u32::try_from(h).map_err(|e| e.to_string())?,
    ))
}

impl RecordArgs {
    fn into_options(self, config: &RecorderConfig) -> RecordingOptions {
        let mut settings = config.default_settings.clone();
        if let Some(fps) = self.fps {
            settings.fps = fps;
        }
        if let Some(bitrate) = self.bitrate {
            settings.bitrate_kbps = bitrate;
        }
        if let Some(codec) = self.codec {
            settings.codec = codec;
        }
        settings.force_ffmpeg |= self.ffmpeg;
        settings.show_cursor &= !self.no_cursor;
        settings.flip_vertical |= self.flip;

        RecordingOptions {
            mode: self.mode.into(),
            window: self.window,
            region: self.region,
            output_path: self.output,
            settings,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RecorderConfig> {
    match path {
        Some(path) => RecorderConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => RecorderConfig::load_default().context("loading default config"),
    }
}

async fn record(config: RecorderConfig, args: RecordArgs) -> Result<()> {
    let duration = args.duration.map(Duration::from_secs);
    let options = args.into_options(&config);
    options.validate()?;

    let manager = RecordingManager::for_platform(&config);
    let mut events = manager.subscribe();

    manager.start(options).await.context("starting recording")?;
    println!(
        "Recording{}... press Ctrl-C to stop",
        if manager.is_using_fallback() { " via ffmpeg" } else { "" }
    );

    let sleep = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(sleep);

    let failure = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break None,
            _ = &mut sleep => break None,
            event = events.recv() => match event {
                Ok(ManagerEvent::Recording(RecordingEvent::ErrorOccurred { error, is_fatal: true })) => {
                    break Some(error);
                }
                Ok(ManagerEvent::RecordingCompleted(path)) => {
                    // the recorder finished without being stopped
                    println!("{}", path.display());
                    return Ok(());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break None,
            },
        }
    };

    if let Some(error) = failure {
        bail!("recording failed: {}", error);
    }

    match manager.stop().await.context("stopping recording")? {
        Some(path) => println!("{}", path.display()),
        None => bail!("recording produced no output"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Command::Record(args) => record(config, args).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
