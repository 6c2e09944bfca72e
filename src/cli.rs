use crate::config::load_config;
use crate::ir::{Orientation, PlanDocument};
use crate::layout_dump::{LayoutDump, write_layout_dump};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(
    name = "plancanvas",
    version,
    about = "Lay out a plan document and dump node positions as JSON"
)]
pub struct Args {
    /// Input plan document (.json) or '-' for stdin
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Output file. Defaults to stdout if omitted.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Engine config file (JSON or JSON5)
    #[arg(short = 'c', long = "configFile")]
    pub config: Option<PathBuf>,

    /// Layout axis; overrides both the config file and the document
    #[arg(long = "orientation", value_enum)]
    pub orientation: Option<OrientationArg>,

    /// Leave out nodes hidden by collapse or hide flags
    #[arg(long = "visible-only")]
    pub visible_only: bool,

    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    pub log_json: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OrientationArg {
    Horizontal,
    Vertical,
}

impl From<OrientationArg> for Orientation {
    fn from(value: OrientationArg) -> Self {
        match value {
            OrientationArg::Horizontal => Orientation::Horizontal,
            OrientationArg::Vertical => Orientation::Vertical,
        }
    }
}

pub fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    execute(&args)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    // Logs go to stderr so they never mix with a dump on stdout.
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("warning: logging already initialised: {err}");
    }
}

pub fn execute(args: &Args) -> Result<()> {
    let config = load_config(args.config.as_deref())
        .with_context(|| format!("loading config {:?}", args.config))?;
    let input = read_input(args.input.as_deref())?;
    let doc = PlanDocument::parse(&input)?;

    // An explicit flag wins, then a non-default config value, then the document.
    let orientation = match args.orientation {
        Some(flag) => flag.into(),
        None if args.config.is_some() && config.orientation != Orientation::default() => {
            config.orientation
        }
        None => doc.canvas.orientation,
    };
    tracing::info!(nodes = doc.nodes.len(), ?orientation, "laying out plan");

    let dump = LayoutDump::from_document(&doc, orientation, &config, args.visible_only)?;
    write_layout_dump(args.output.as_deref(), &dump)
        .with_context(|| format!("writing layout to {:?}", args.output))?;
    Ok(())
}

fn read_input(path: Option<&Path>) -> Result<String> {
    if let Some(path) = path
        && path != Path::new("-")
    {
        return std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()));
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}
