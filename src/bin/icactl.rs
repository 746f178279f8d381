use std::env;
use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ica_kit::backend::WhiteningBackend;
use ica_kit::config::{load_config, save_config};
use ica_kit::persist::{CONFIG_FILE, ProcessorSettings};
use ica_kit::training::load_run;
use ica_kit::{IcaConfig, IcaProcessor, InputChannel, PlanarBuffer};

const SETTINGS_FILE: &str = "settings.json";
const DEMO_CHANNELS: usize = 4;
const DEMO_RATE: f32 = 500.0;
const DEMO_BLOCK: usize = 50;

fn usage() {
    println!(
        "Usage: icactl [demo [SECONDS]] | --status [SETTINGS] | inspect RUN_DIR\n\n\
         Without arguments the demo console launches: a synthetic {DEMO_CHANNELS}-channel\n\
         mixture is processed in real time and trained with the built-in whitening backend.\n\
         Logs go to stderr; redirect it (2>icactl.log) to keep the console clean."
    );
}

fn settings_path(config: &IcaConfig) -> PathBuf {
    config.output_root.join(SETTINGS_FILE)
}

fn print_status(path: Option<&str>) {
    let path = path
        .map(PathBuf::from)
        .unwrap_or_else(|| settings_path(&IcaConfig::from_env()));
    if !path.exists() {
        eprintln!("icactl: no saved settings at {}", path.display());
        process::exit(1);
    }
    let settings: ProcessorSettings = load_config(&path);
    println!("Settings    : {}", path.display());
    println!("Output root : {}", settings.config.output_root.display());
    println!("Duration    : {:.0} s", settings.config.training_duration_secs);
    println!("Target rate : {:.0} Hz", settings.config.target_sample_rate);
    if let Some(current) = settings.current_stream {
        println!("Current     : stream {current}");
    }
    println!("Streams:");
    for stream in &settings.streams {
        let dir = stream
            .decomposition_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "none".into());
        match &stream.operation {
            Some(op) => println!(
                "  [{}] {} | channels={} | rejected={} | dir={}",
                stream.stream_id,
                stream.stream_name,
                op.enabled_channels,
                if op.rejected_components.is_empty() { "none" } else { op.rejected_components.as_str() },
                dir,
            ),
            None => println!(
                "  [{}] {} | no decomposition",
                stream.stream_id, stream.stream_name
            ),
        }
    }
}

fn inspect(dir: &Path) {
    let config_file = if dir.is_dir() { dir.join(CONFIG_FILE) } else { dir.to_path_buf() };
    let run = match load_run(&config_file) {
        Ok(run) => run,
        Err(err) => {
            eprintln!("icactl: {err}");
            process::exit(1);
        }
    };
    let channels: Vec<String> = run.enabled_channels.iter().map(|c| (c + 1).to_string()).collect();
    println!("Run         : {}", config_file.display());
    println!("Channels    : {}", channels.join(" "));
    println!("Mixing:{}", run.mixing);
    println!("Unmixing:{}", run.unmixing);
    let norms: Vec<String> = run
        .mixing
        .column_iter()
        .map(|col| format!("{:.3}", col.norm()))
        .collect();
    println!("Column norms: {}", norms.join(" "));
}

/// Four independent sources mixed onto four channels.
struct Mixture {
    frame: u64,
    noise: u32,
}

impl Mixture {
    const MIXING: [[f32; DEMO_CHANNELS]; DEMO_CHANNELS] = [
        [1.0, 0.5, 0.3, 0.1],
        [0.4, 1.0, 0.2, 0.3],
        [0.2, 0.3, 1.0, 0.5],
        [0.6, 0.1, 0.4, 1.0],
    ];

    fn sources(&mut self) -> [f32; DEMO_CHANNELS] {
        let t = self.frame as f32 / DEMO_RATE;
        self.frame += 1;
        self.noise = self.noise.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let noise = (self.noise >> 8) as f32 / (1u32 << 24) as f32 - 0.5;
        [
            (TAU * 7.0 * t).sin(),
            if (t * 3.0).fract() < 0.5 { 1.0 } else { -1.0 },
            (t * 1.3).fract() * 2.0 - 1.0,
            noise,
        ]
    }

    fn fill(&mut self, block: &mut PlanarBuffer) {
        use ica_kit::ChannelBuffer;

        for n in 0..block.num_samples() {
            let sources = self.sources();
            for (channel, weights) in Self::MIXING.iter().enumerate() {
                let value = weights.iter().zip(&sources).map(|(w, s)| w * s).sum();
                block.channel_mut(channel)[n] = value;
            }
        }
    }
}

fn demo(duration: Option<f32>) {
    let mut config = IcaConfig::from_env();
    config.training_duration_secs = duration.unwrap_or(20.0);
    let settings_file = settings_path(&config);
    let processor = Arc::new(IcaProcessor::with_backend(config, Arc::new(WhiteningBackend)));

    let channels: Vec<InputChannel> = (0..DEMO_CHANNELS)
        .map(|i| InputChannel {
            global_index: i,
            stream_id: 1,
            stream_name: "Synthetic".into(),
            name: format!("CH{}", i + 1),
            sample_rate: DEMO_RATE,
        })
        .collect();
    processor.update_streams(&channels);
    if settings_file.exists() {
        let settings: ProcessorSettings = load_config(&settings_file);
        processor.restore_settings(&settings);
        if let Some(seconds) = duration {
            if let Err(err) = processor.set_training_duration(seconds) {
                eprintln!("icactl: {err}");
            }
        }
    }
    ica_kit::register_processor(Arc::clone(&processor));

    let running = Arc::new(AtomicBool::new(true));
    let feeder = {
        let processor = Arc::clone(&processor);
        let running = Arc::clone(&running);
        std::thread::Builder::new()
            .name("icactl-feed".into())
            .spawn(move || {
                let mut mixture = Mixture { frame: 0, noise: 1 };
                let mut block = PlanarBuffer::new(DEMO_CHANNELS, DEMO_BLOCK);
                let period = Duration::from_secs_f32(DEMO_BLOCK as f32 / DEMO_RATE);
                while running.load(Ordering::Relaxed) {
                    mixture.fill(&mut block);
                    processor.process(&mut block);
                    std::thread::sleep(period);
                }
            })
    };
    let feeder = match feeder {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("icactl: failed to start feeder: {err}");
            process::exit(1);
        }
    };

    let result = ica_kit::control::ui::run();
    running.store(false, Ordering::Relaxed);
    let _ = feeder.join();
    processor.cancel_training();

    if let Err(err) = save_config(&processor.save_settings(), &settings_file) {
        eprintln!("icactl: failed to save settings: {err}");
    }
    ica_kit::unregister_processor(&processor);
    if let Err(err) = result {
        eprintln!("icactl: {err}");
        process::exit(1);
    }
}

fn main() {
    ica_kit::init_tracing();
    let mut args = env::args().skip(1);
    let Some(arg) = args.next() else {
        demo(None);
        return;
    };
    match arg.as_str() {
        "--status" | "-s" | "status" => print_status(args.next().as_deref()),
        "inspect" => match args.next() {
            Some(dir) => inspect(Path::new(&dir)),
            None => {
                eprintln!("icactl: inspect needs a run directory");
                process::exit(1);
            }
        },
        "demo" => {
            let seconds = args.next().map(|s| s.parse::<f32>());
            match seconds {
                Some(Ok(value)) if value > 0.0 => demo(Some(value)),
                Some(_) => {
                    eprintln!("icactl: demo expects a positive duration in seconds");
                    process::exit(1);
                }
                None => demo(None),
            }
        }
        "--help" | "-h" => usage(),
        other => {
            eprintln!("icactl: unknown argument '{other}'");
            process::exit(1);
        }
    }
}
