// Capture from an ASIX SIGMA / SIGMA2
//
// Scans for SIGMA devices, configures the first one and prints the
// downloaded logic data. Triggers are given per probe, e.g. `--trigger 0:r
// --trigger 3:1` for a rising edge on probe 0 while probe 3 is high.

use clap::Parser;
use sampleflow_rs::config::{ConfigKey, ConfigValue};
use sampleflow_rs::driver::{config_set, Context, ContextConfig};
use sampleflow_rs::drivers::asix_sigma::SigmaDriver;
use sampleflow_rs::LogicCapture;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sigma_capture")]
#[command(about = "Capture logic data from an ASIX SIGMA", long_about = None)]
struct Cli {
    /// Directory holding the asix-sigma-*.fw files
    #[arg(long)]
    firmware_dir: Option<PathBuf>,

    /// Samplerate in Hz
    #[arg(long, default_value_t = 1_000_000)]
    samplerate: u64,

    /// Number of samples to capture
    #[arg(long, default_value_t = 10_000)]
    samples: u64,

    /// Share of the capture placed after the trigger, in percent
    #[arg(long, default_value_t = 50)]
    capture_ratio: u64,

    /// Probe trigger as INDEX:SPEC, SPEC being 0, 1, r or f
    #[arg(long = "trigger", value_parser = parse_trigger)]
    triggers: Vec<(usize, String)>,

    /// Rows of the table to print
    #[arg(long, default_value_t = 16)]
    rows: usize,
}

fn parse_trigger(arg: &str) -> Result<(usize, String), String> {
    let (index, spec) = arg
        .split_once(':')
        .ok_or_else(|| format!("expected INDEX:SPEC, got '{arg}'"))?;
    let index = index.parse().map_err(|e| format!("invalid probe index '{index}': {e}"))?;
    Ok((index, spec.to_string()))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    #[cfg(feature = "cpu-profiling")]
    let _client = tracy_client::Client::start();

    let cli = Cli::parse();

    let mut config = ContextConfig::from_env();
    if let Some(dir) = cli.firmware_dir {
        config = config.with_firmware_dir(dir);
    }
    let mut ctx = Context::with_config(config);
    ctx.register(SigmaDriver::default())?;
    ctx.init_driver(SigmaDriver::NAME)?;

    let Some(dev) = ctx.scan(SigmaDriver::NAME, &[]).into_iter().next() else {
        println!("No ASIX SIGMA found");
        return Ok(());
    };
    ctx.dev_open(&dev)?;
    {
        let mut dev = dev.borrow_mut();
        config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(cli.samplerate), None)?;
        config_set(&mut dev, ConfigKey::CaptureRatio, &ConfigValue::Uint64(cli.capture_ratio), None)?;
        config_set(&mut dev, ConfigKey::LimitSamples, &ConfigValue::Uint64(cli.samples), None)?;
        for (index, spec) in &cli.triggers {
            dev.set_probe_trigger(*index, Some(spec))?;
        }
        println!("Capturing {} samples at {} Hz from {}", cli.samples, cli.samplerate, dev.key());
    }

    let mut session = ctx.new_session();
    session.add_device(dev.clone())?;
    let capture = LogicCapture::attach(&mut session, dev.borrow().key());
    session.start()?;
    session.run()?;

    let df = capture.to_dataframe(dev.borrow().probes())?;
    println!("Downloaded {} samples", df.height());
    match capture.trigger_index() {
        Some(index) => println!("Trigger at sample {index}"),
        None => println!("No trigger"),
    }
    println!("{}", df.head(Some(cli.rows)));

    ctx.dev_close(&dev)?;
    Ok(())
}
