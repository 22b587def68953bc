use anyhow::{bail, Result};
use clap::Parser;
use log::{info, warn};
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use cranksync::config::{SecondaryPattern, TriggerConfig, TriggerSpeed, WheelPattern};
use cranksync::decoder::{EdgeDirection, TriggerChannel, TriggerDecoder, TriggerEdge};
use cranksync::ignition::IGN_CHANNELS;
use cranksync::status::EngineStatus;
use cranksync::tooth_log::LogMode;
use cranksync::traits::{IgnitionTimer, TriggerClock, TriggerInputs};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Trigger configuration JSON. Defaults to a 36-1 crank wheel.
    #[arg(short, long)]
    config: Option<String>,

    /// Simulated engine speed.
    #[arg(long, default_value_t = 3000)]
    rpm: u32,

    /// Engine cycles (720 degrees each) to simulate. Ignored with --live.
    #[arg(long, default_value_t = 50)]
    cycles: u32,

    /// Run paced in real time until Ctrl+C.
    #[arg(long, default_value_t = false)]
    live: bool,

    /// Print a status line every this many revolutions.
    #[arg(long, default_value_t = 10)]
    status_every: u16,

    /// Tooth log capture mode: off, tooth or composite.
    #[arg(long, default_value = "off")]
    log_mode: String,

    /// Channel 1 spark end angle, for the end-tooth calculation.
    #[arg(long, default_value_t = 355)]
    end_angle: i16,
}

// ============================================================================
// SIMULATED HARDWARE
// ============================================================================

#[derive(Clone)]
struct SimClock(Rc<Cell<u32>>);

impl TriggerClock for SimClock {
    fn micros(&self) -> u32 {
        self.0.get()
    }
}

#[derive(Clone, Default)]
struct SimInputs {
    primary: Rc<Cell<bool>>,
    secondary: Rc<Cell<bool>>,
}

impl TriggerInputs for SimInputs {
    fn primary_level(&self) -> bool {
        self.primary.get()
    }

    fn secondary_level(&self) -> bool {
        self.secondary.get()
    }
}

struct SimTimer {
    clock: Rc<Cell<u32>>,
    compares: [u32; IGN_CHANNELS],
    compare_writes: u32,
    coil_ends: u32,
}

impl SimTimer {
    fn new(clock: Rc<Cell<u32>>) -> Self {
        SimTimer {
            clock,
            compares: [0; IGN_CHANNELS],
            compare_writes: 0,
            coil_ends: 0,
        }
    }
}

impl IgnitionTimer for SimTimer {
    fn counter(&self, _channel: usize) -> u32 {
        self.clock.get()
    }

    fn set_compare(&mut self, channel: usize, compare: u32) {
        self.compares[channel] = compare;
        self.compare_writes += 1;
    }

    fn end_coil_charge(&mut self, _channel: usize) {
        self.coil_ends += 1;
    }

    fn us_to_ticks(&self, us: u32) -> u32 {
        us
    }
}

// ============================================================================
// WHEEL SIMULATION
// ============================================================================

/// Edge stream generator for the configured wheel, one engine cycle
/// (720 crank degrees) at a time.
struct WheelSim {
    cfg: TriggerConfig,
    /// Time of one crank revolution at the target speed.
    crank_rev_us: u32,
}

impl WheelSim {
    fn new(cfg: TriggerConfig, rpm: u32) -> Self {
        WheelSim {
            cfg,
            crank_rev_us: 60_000_000 / rpm.max(10),
        }
    }

    fn cycle_us(&self) -> u32 {
        self.crank_rev_us * 2
    }

    /// All edges of one engine cycle starting at `start`, time-ordered.
    fn cycle_edges(&self, start: u32) -> Vec<(u32, TriggerChannel)> {
        let mut edges = Vec::new();
        let wheel = &self.cfg.wheel;

        match wheel.pattern {
            WheelPattern::MissingTooth => {
                let teeth = u32::from(wheel.trigger_teeth);
                let missing = u32::from(wheel.missing_teeth);
                if wheel.trigger_speed == TriggerSpeed::Cam {
                    // One pattern per 720 degrees.
                    let gap = self.cycle_us() / teeth;
                    for slot in 0..(teeth - missing) {
                        edges.push((start.wrapping_add(slot * gap), TriggerChannel::Primary));
                    }
                } else {
                    let gap = self.crank_rev_us / teeth;
                    for rev in 0..2u32 {
                        let rev_start = start.wrapping_add(rev * self.crank_rev_us);
                        for slot in 0..(teeth - missing) {
                            edges.push((rev_start.wrapping_add(slot * gap), TriggerChannel::Primary));
                        }
                    }
                    if self.cfg.edges.secondary_pattern == SecondaryPattern::Single {
                        // Single cam tooth midway through revolution one.
                        edges.push((
                            start.wrapping_add(self.crank_rev_us / 2),
                            TriggerChannel::Secondary,
                        ));
                    }
                }
            }
            WheelPattern::DualWheel | WheelPattern::Non360 => {
                let teeth = u32::from(wheel.trigger_teeth);
                let gap = self.crank_rev_us / teeth;
                for rev in 0..2u32 {
                    let rev_start = start.wrapping_add(rev * self.crank_rev_us);
                    for slot in 0..teeth {
                        edges.push((rev_start.wrapping_add(slot * gap), TriggerChannel::Primary));
                    }
                }
                // Cam reference in the last gap before the cycle wraps.
                edges.push((
                    start.wrapping_add(self.cycle_us() - gap / 2),
                    TriggerChannel::Secondary,
                ));
            }
            WheelPattern::BasicDistributor => {
                let teeth = u32::from(wheel.n_cylinders.max(1));
                let gap = self.cycle_us() / teeth;
                for slot in 0..teeth {
                    edges.push((start.wrapping_add(slot * gap), TriggerChannel::Primary));
                }
            }
        }

        edges.sort_by_key(|&(t, _)| t.wrapping_sub(start));
        edges
    }
}

// ============================================================================
// MAIN LOOP
// ============================================================================

fn load_config(args: &Args) -> Result<TriggerConfig> {
    match &args.config {
        Some(path) => TriggerConfig::from_file(path),
        None => Ok(TriggerConfig::default()),
    }
}

fn parse_log_mode(mode: &str) -> Result<LogMode> {
    match mode {
        "off" => Ok(LogMode::Off),
        "tooth" => Ok(LogMode::Tooth),
        "composite" => Ok(LogMode::Composite),
        other => bail!("unknown log mode '{}' (off, tooth, composite)", other),
    }
}

fn run_simulation(args: Args, running: Arc<AtomicBool>) -> Result<()> {
    let cfg = load_config(&args)?;
    cfg.validate()?;

    let ticks = Rc::new(Cell::new(0u32));
    let clock = SimClock(ticks.clone());
    let inputs = SimInputs::default();
    let timer = SimTimer::new(ticks.clone());

    let mut decoder = TriggerDecoder::new(cfg.clone(), clock, inputs.clone(), timer);
    decoder.log.set_mode(parse_log_mode(&args.log_mode)?);
    decoder.ignition_mut().set_end_angle(0, args.end_angle);
    decoder.set_end_teeth();
    info!(
        "Channel 1 end angle {} -> end tooth {}",
        args.end_angle,
        decoder.ignition().end_tooth(0)
    );

    let status_shared = Arc::new(RwLock::new(EngineStatus::default()));
    let sim = WheelSim::new(cfg, args.rpm);

    info!(
        "Simulating {} RPM, cycle {}us{}",
        args.rpm,
        sim.cycle_us(),
        if args.live {
            " (live until Ctrl+C)".to_string()
        } else {
            format!(", {} cycles", args.cycles)
        }
    );

    let mut start = 1_000u32;
    let mut cycle = 0u32;
    let mut last_status_revs = 0u16;

    while running.load(Ordering::SeqCst) && (args.live || cycle < args.cycles) {
        for (time, channel) in sim.cycle_edges(start) {
            ticks.set(time);
            match channel {
                TriggerChannel::Primary => inputs.primary.set(true),
                TriggerChannel::Secondary => inputs.secondary.set(true),
                TriggerChannel::Tertiary => {}
            }
            decoder.handle_edge(TriggerEdge {
                channel,
                direction: EdgeDirection::Rising,
                timestamp: time,
            });
            match channel {
                TriggerChannel::Primary => inputs.primary.set(false),
                TriggerChannel::Secondary => inputs.secondary.set(false),
                TriggerChannel::Tertiary => {}
            }

            // Mainline polling, as the controller loop would.
            decoder.get_rpm();
        }

        start = start.wrapping_add(sim.cycle_us());
        cycle += 1;

        let revs = decoder.state().start_revolutions;
        if args.status_every > 0 && revs.saturating_sub(last_status_revs) >= args.status_every {
            last_status_revs = revs;
            let status = decoder.status();
            if let Ok(mut shared) = status_shared.write() {
                *shared = status.clone();
            }
            println!("{}", serde_json::to_string(&status)?);
        }

        if args.live {
            thread::sleep(Duration::from_micros(u64::from(sim.cycle_us())));
        }
    }

    let final_status = decoder.status();
    info!(
        "Run complete: {} cycles, {} revolutions, {} sync losses, final mode {}",
        cycle, final_status.start_revolutions, final_status.sync_loss_counter, final_status.mode
    );

    // Wind-down: let the stall supervisor see the silence and reset.
    ticks.set(start.wrapping_add(decoder.state().max_stall_time + 1));
    if decoder.is_stalled() {
        info!("Stall detected after stream end; reinitializing decoder");
        decoder.setup();
    }

    if decoder.log.mode() != LogMode::Off {
        let drained = decoder.log.drain();
        info!("Tooth log drained: {} bytes", drained.len());
    }

    let timer = decoder.timer();
    if timer.compare_writes > 0 || timer.coil_ends > 0 {
        info!(
            "Ignition: {} compare writes (ch1 compare {}), {} forced coil ends",
            timer.compare_writes, timer.compares[0], timer.coil_ends
        );
    }

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Console logging, clean format.
    env_logger::builder()
        .format_timestamp(None)
        .format_target(false)
        .format_level(false)
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("CrankSync Simulator v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Started {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        warn!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    run_simulation(args, running)
}
