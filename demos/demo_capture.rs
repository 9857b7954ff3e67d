// Capture from the demo driver
//
// Runs the pattern generator for a fixed number of samples or milliseconds
// and prints the captured logic data as a table.

use clap::Parser;
use sampleflow_rs::config::{ConfigKey, ConfigValue};
use sampleflow_rs::driver::{config_set, Context};
use sampleflow_rs::drivers::demo::DemoDriver;
use sampleflow_rs::{LogicCapture, Packet};
use std::cell::Cell;
use std::rc::Rc;

#[derive(Parser)]
#[command(name = "demo_capture")]
#[command(about = "Capture samples from the demo pattern generator", long_about = None)]
struct Cli {
    /// Number of samples to capture
    #[arg(long, default_value_t = 2000, conflicts_with = "time_ms")]
    samples: u64,

    /// Capture duration in milliseconds instead of a sample count
    #[arg(long)]
    time_ms: Option<u64>,

    /// Samplerate in Hz
    #[arg(long, default_value_t = 200_000)]
    samplerate: u64,

    /// Logic pattern: sigrok, random, incremental, all-low or all-high
    #[arg(long, default_value = "sigrok")]
    pattern: String,

    /// Rows of the table to print
    #[arg(long, default_value_t = 16)]
    rows: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    #[cfg(feature = "cpu-profiling")]
    let _client = tracy_client::Client::start();

    let cli = Cli::parse();

    println!("Demo Driver Capture");
    println!("===================\n");

    let mut ctx = Context::new();
    ctx.register(DemoDriver::new())?;
    ctx.init_driver(DemoDriver::NAME)?;

    let dev = ctx.scan(DemoDriver::NAME, &[]).remove(0);
    ctx.dev_open(&dev)?;
    {
        let mut dev = dev.borrow_mut();
        config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(cli.samplerate), None)?;
        config_set(&mut dev, ConfigKey::PatternMode, &ConfigValue::from(cli.pattern.as_str()), None)?;
        match cli.time_ms {
            Some(ms) => config_set(&mut dev, ConfigKey::LimitMsec, &ConfigValue::Uint64(ms), None)?,
            None => config_set(&mut dev, ConfigKey::LimitSamples, &ConfigValue::Uint64(cli.samples), None)?,
        }
        println!("Opened {} {} with {} probes", dev.vendor, dev.model, dev.probes().len());
    }

    let mut session = ctx.new_session();
    session.add_device(dev.clone())?;
    let capture = LogicCapture::attach(&mut session, dev.borrow().key());

    let analog_packets = Rc::new(Cell::new(0usize));
    let counter = analog_packets.clone();
    session.add_consumer(move |_, packet| {
        if matches!(packet, Packet::Analog(_)) {
            counter.set(counter.get() + 1);
        }
    });

    session.start()?;
    session.run()?;

    let df = capture.to_dataframe(dev.borrow().probes())?;
    println!("Captured {} logic samples, {} analog packets\n", df.height(), analog_packets.get());
    println!("{}", df.head(Some(cli.rows)));

    ctx.dev_close(&dev)?;
    Ok(())
}
