// Pump and purge shot monitor
//
// Acquires the configured analog inputs continuously, prints every detected
// shot, and shows a summary of the recorded block averages on exit. Without
// --port a simulated device produces a periodic pump pulse on ai2.

use clap::Parser;
use shotwatch_rs::{
    AcquisitionConfig, AcquisitionController, DaqDriver, DaqTerminal, MonitoredChannel,
    SerialDaqDriver, SimulatedDriver, DEFAULT_SHOT_THRESHOLD,
};
use std::io::BufRead;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "monitor_shots")]
#[command(version = "0.1")]
#[command(about = "Watch DAQ analog inputs for pump and purge shots")]
struct Args {
    /// Physical channels to acquire
    #[arg(short, long, default_value = "cDAQ1Mod1/ai0:1, cDAQ1Mod1/ai2:3")]
    channels: String,

    /// Serial port of a DAQ command shell; simulated device when omitted
    #[arg(short, long)]
    port: Option<String>,

    #[arg(long, default_value_t = DaqTerminal::DEFAULT_BAUD_RATE)]
    baud: u32,

    #[arg(long, default_value_t = -10.0, allow_negative_numbers = true)]
    min_voltage: f64,

    #[arg(long, default_value_t = 10.0)]
    max_voltage: f64,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 125.0)]
    rate: f64,

    /// Samples per channel in the device buffer
    #[arg(short, long, default_value_t = 200)]
    block_size: usize,

    /// Samples per channel between callbacks (defaults to the block size)
    #[arg(long)]
    samples_per_callback: Option<usize>,

    /// Monitored input as LABEL:CHANNEL[:THRESHOLD]; repeatable
    #[arg(short, long = "monitor", value_parser = parse_monitor)]
    monitors: Vec<MonitoredChannel>,

    /// Stop after this many seconds instead of waiting for Enter
    #[arg(short, long)]
    duration: Option<u64>,

    /// Blocks of averages to keep for the exit summary
    #[arg(long, default_value_t = 512)]
    history: usize,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn parse_monitor(s: &str) -> Result<MonitoredChannel, String> {
    let mut parts = s.split(':');
    let label = parts.next().filter(|l| !l.is_empty()).ok_or("missing label")?;
    let channel = parts
        .next()
        .ok_or("missing channel")?
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("invalid channel: {e}"))?;
    let threshold = match parts.next() {
        Some(t) => t
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid threshold: {e}"))?,
        None => DEFAULT_SHOT_THRESHOLD,
    };
    Ok(MonitoredChannel::on_channel(channel)
        .named(label)
        .rising_above(threshold))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    #[cfg(feature = "cpu-profiling")]
    let _tracy = tracy_client::Client::start();

    let mut builder = AcquisitionConfig::builder(&args.channels)
        .voltage_range(args.min_voltage, args.max_voltage)
        .sample_rate(args.rate)
        .block_size(args.block_size)
        .history_blocks(args.history);
    if let Some(samples) = args.samples_per_callback {
        builder = builder.samples_per_callback(samples);
    }
    let monitors = if args.monitors.is_empty() {
        vec![
            MonitoredChannel::on_channel(2).named("Pump shot").shot(),
            MonitoredChannel::on_channel(3).named("Purge shot").shot(),
        ]
    } else {
        args.monitors.clone()
    };
    for monitor in monitors {
        builder = builder.monitor(monitor);
    }
    let config = builder.build()?;

    println!("Shot Monitor");
    println!("============");
    println!("Channels: {}", config.channels());
    println!(
        "Rate: {} Hz, block: {} samples, callback every {:?}",
        config.sample_rate(),
        config.block_size(),
        config.callback_period()
    );
    for monitor in config.monitored() {
        println!(
            "Watching {} on channel {} (> {:.2} V)",
            monitor.label(),
            monitor.channel(),
            monitor.threshold()
        );
    }

    match &args.port {
        Some(port) => {
            let driver = Arc::new(SerialDaqDriver::open(port, args.baud)?);
            println!("Device: serial shell on {port}\n");
            run(driver, config, args.duration)
        }
        None => {
            // 2 s period, pump high for the first 400 ms
            let rate = config.sample_rate();
            let driver = Arc::new(SimulatedDriver::paced(Box::new(move |channel, k| {
                let t = k as f64 / rate;
                match channel {
                    2 if t % 2.0 < 0.4 => 8.2,
                    2 | 3 => 0.4,
                    _ => 1.0 + 0.1 * channel as f64,
                }
            })));
            println!("Device: simulated\n");
            run(driver, config, args.duration)
        }
    }
}

fn run<D: DaqDriver + 'static>(
    driver: Arc<D>,
    config: AcquisitionConfig,
    duration: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, rx) = mpsc::channel();
    let mut controller = AcquisitionController::new(driver).with_event_sink(tx);

    controller.create_session(config)?;
    controller.start_session()?;

    let printer = std::thread::spawn(move || {
        let mut shots = 0u64;
        for event in rx {
            shots += 1;
            println!("✓ {event}");
        }
        shots
    });

    match duration {
        Some(secs) => {
            println!("Monitoring for {secs} s\n");
            let deadline = Instant::now() + Duration::from_secs(secs);
            while Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        None => {
            println!("Monitoring. Press Enter to stop and exit.\n");
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
        }
    }

    controller.stop_session();
    if let Some(session) = controller.session() {
        if let Some(fault) = session.take_fault() {
            eprintln!("Acquisition aborted: {fault}");
        }
        println!("\nBlocks processed: {}", session.blocks_processed());
        if let Some(summary) = session.history_summary() {
            println!("{}", summary?);
        }
    }
    controller.clear_session();
    drop(controller);

    let shots = printer.join().unwrap_or(0);
    println!("Shots detected: {shots}");
    Ok(())
}
