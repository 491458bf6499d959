//! Runs a full conversation against the loopback transport.
//!
//! A synthetic tone stands in for the microphone; the transport echoes every
//! frame back as model audio, which is scheduled on a timeline. With
//! `--speaker` the timeline plays through the default output device,
//! otherwise a clock thread renders it into a silent buffer in real time.
//!
//! ```text
//! loopback [CONFIG_PATH] [--seconds N] [--interrupt-every N] [--speaker]
//! loopback --list-devices
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxrelay_core::{
    audio::device::{list_input_devices, list_output_devices},
    config::{default_config_path, load_config},
    ConversationEngine, ConversationState, LoopbackTransport, Speaker, SyntheticMicrophone,
    TimelineSink,
};

#[derive(Debug)]
struct Args {
    config_path: PathBuf,
    seconds: u64,
    interrupt_every: Option<usize>,
    speaker: bool,
    list_devices: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config_path: default_config_path(),
        seconds: 3,
        interrupt_every: None,
        speaker: false,
        list_devices: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--seconds" => {
                args.seconds = it
                    .next()
                    .context("--seconds needs a value")?
                    .parse()
                    .context("--seconds must be a whole number")?;
            }
            "--interrupt-every" => {
                args.interrupt_every = Some(
                    it.next()
                        .context("--interrupt-every needs a value")?
                        .parse()
                        .context("--interrupt-every must be a whole number")?,
                );
            }
            "--speaker" => args.speaker = true,
            "--list-devices" => args.list_devices = true,
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            path => args.config_path = PathBuf::from(path),
        }
    }
    Ok(args)
}

/// Advances a timeline nobody listens to, at wall-clock speed.
fn spawn_virtual_clock(sink: &TimelineSink, running: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    let timeline = sink.shared();
    std::thread::spawn(move || {
        let (rate, channels) = {
            let t = timeline.lock();
            (t.sample_rate(), t.channels())
        };
        let tick = Duration::from_millis(10);
        let mut block = vec![0f32; (rate as usize / 100) * channels as usize];
        while running.load(Ordering::Acquire) {
            timeline.lock().render(&mut block);
            std::thread::sleep(tick);
        }
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("voxrelay_core=info,loopback=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("loopback failed: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    if args.list_devices {
        let mut devices = list_input_devices();
        devices.extend(list_output_devices());
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    let config = load_config(&args.config_path);
    info!(path = %args.config_path.display(), "loaded voice config");

    let clock_running = Arc::new(AtomicBool::new(true));
    let mut clock = None;
    let (_speaker, sink): (Option<Speaker>, TimelineSink) = if args.speaker {
        let (speaker, sink) = Speaker::open(
            config.preferred_output_device.as_deref(),
            config.output_sample_rate,
            config.output_gain,
            config.permission_timeout(),
        )?;
        (Some(speaker), sink)
    } else {
        let sink = TimelineSink::new(
            config.output_sample_rate,
            config.output_channels,
            config.output_gain,
        );
        clock = Some(spawn_virtual_clock(&sink, Arc::clone(&clock_running)));
        (None, sink)
    };

    let transport = LoopbackTransport {
        interrupt_every: args.interrupt_every,
        echo_sample_rate: Some(config.output_sample_rate),
        ..LoopbackTransport::default()
    };
    let engine = ConversationEngine::new(config, transport, SyntheticMicrophone::default(), sink);
    let mut status = engine.subscribe_status();

    engine.start("loopback")?;
    let deadline = Instant::now() + engine.config().connect_timeout();
    while engine.state() != ConversationState::Open {
        if Instant::now() > deadline {
            bail!("session never opened (state {:?})", engine.state());
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    if !engine.start_capture()? {
        bail!("capture did not start");
    }
    std::thread::sleep(Duration::from_secs(args.seconds));
    engine.stop_capture();
    engine.end();

    while let Ok(event) = status.try_recv() {
        info!(state = ?event.state, detail = event.detail.as_deref().unwrap_or(""), "status");
    }

    clock_running.store(false, Ordering::Release);
    if let Some(clock) = clock {
        let _ = clock.join();
    }

    println!("{}", serde_json::to_string_pretty(&engine.diagnostics_snapshot())?);
    Ok(())
}
