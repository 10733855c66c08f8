//! RayOS ISChain CLI
//!
//! Runs the reference pipeline against the simulated block drivers and
//! prints the scheduler statistics. Useful for eyeballing the scheduler's
//! logs under fault injection without hardware.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use crossbeam::channel::Receiver;
use rayos_ischain::stages::{ids, reference_layout};
use rayos_ischain::{
    ChainConfig, DoneEvent, DoneKind, DoneMessage, FrameState, FrameTemplate, FrameView, Instance, LockOutcome,
    OutputSet, PlaneBuffer, Scheduler, SchedulerConfig, StageChain, StartOutcome, TriggerMode,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const SENSOR: Instance = Instance(0);
const M2M: Instance = Instance(1);

#[derive(Parser)]
#[command(name = "ischain")]
#[command(about = "RayOS ISChain - imaging stage-chain scheduler", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the sensor chain and the motion chain for a number of frames
    Simulate {
        /// Trigger ticks to run
        #[arg(short = 'n', long, default_value = "30")]
        frames: u64,

        /// Shot timeout of both chains (ms)
        #[arg(long, default_value = "40")]
        timeout_ms: u64,

        /// Withhold completion of this sensor frame so the watchdog fires
        #[arg(long)]
        stall_at: Option<u64>,

        /// Submit every Nth sensor request behind the trigger
        #[arg(long)]
        late_every: Option<u64>,

        /// Reject the motion estimator's shot for this frame
        #[arg(long)]
        fail_shot_at: Option<u64>,

        /// Deliver each sensor frame's done signals in a random order
        #[arg(long, value_name = "SEED")]
        shuffle_seed: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the reference chain table
    Table,
}

#[derive(Debug, Default, Serialize)]
struct Tally {
    shots_done: u64,
    shots_failed: u64,
    outputs_done: u64,
}

impl Tally {
    fn drain(&mut self, rx: &Receiver<DoneMessage>) {
        while let Ok(message) = rx.try_recv() {
            match message.kind {
                DoneKind::Shot if message.reason.is_success() => self.shots_done += 1,
                DoneKind::Shot => self.shots_failed += 1,
                DoneKind::Output(_) => self.outputs_done += 1,
            }
        }
    }
}

#[derive(Serialize)]
struct Report {
    statistics: rayos_ischain::SchedulerStatistics,
    notifications: Tally,
    drivers: Vec<(String, rayos_ischain::stages::DriverSnapshot)>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = match &cli.config {
        Some(path) => {
            log::info!("Loading config from: {}", path.display());
            SchedulerConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };

    match cli.command {
        Commands::Table => print_table(&config)?,
        Commands::Simulate {
            frames,
            timeout_ms,
            stall_at,
            late_every,
            fail_shot_at,
            shuffle_seed,
            json,
        } => {
            let sim = Simulation {
                frames,
                timeout_ms,
                stall_at,
                late_every,
                fail_shot_at,
                shuffle: shuffle_seed.map(|seed| Mutex::new(fastrand::Rng::with_seed(seed))),
            };
            let report = sim.run(config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
    }

    Ok(())
}

fn print_table(config: &SchedulerConfig) -> Result<()> {
    let layout = reference_layout(config.bug_threshold)?;
    for route in layout.table.routes() {
        let names = route
            .stages
            .iter()
            .map(|id| layout.registry.stage(*id).map(|s| s.name().to_string()))
            .collect::<rayos_ischain::Result<Vec<_>>>()?;
        println!("{} {:<12} {} (leader {})", route.id, route.name, names.join(" -> "), route.leader_output);
    }
    Ok(())
}

fn print_report(report: &Report) {
    let s = &report.statistics;
    println!("\n=== Scheduler ===");
    println!("Admitted: {}", s.admitted);
    println!("Dispatched: {} ({} failed)", s.dispatched, s.dispatch_failures);
    println!("Internal shots: {}", s.internal_shots);
    println!("Late shots: {}", s.late_shots);
    println!("Duplicate starts: {}", s.duplicate_starts);
    println!("Retired: {}", s.retired);
    println!("Timeouts: {} ({} false alarms)", s.timeouts, s.false_alarms);
    println!("Flushed: {}", s.flushed);
    println!("Notifications: {} ({} dropped)", s.notifications, s.notifications_dropped);

    println!("\n=== Work Queue ===");
    println!("Shots done: {}", report.notifications.shots_done);
    println!("Shots not done: {}", report.notifications.shots_failed);
    println!("Outputs done: {}", report.notifications.outputs_done);

    println!("\n=== Blocks ===");
    for (name, d) in &report.drivers {
        println!(
            "{:<6} shots {:>4}  meta {:>4}  ndone {:>3}  restore {}  timeout {}",
            name, d.shots, d.metas, d.ndones, d.restores, d.timeouts
        );
    }
}

struct Simulation {
    frames: u64,
    timeout_ms: u64,
    stall_at: Option<u64>,
    late_every: Option<u64>,
    fail_shot_at: Option<u64>,
    shuffle: Option<Mutex<fastrand::Rng>>,
}

impl Simulation {
    async fn run(&self, config: SchedulerConfig) -> Result<Report> {
        let layout = reference_layout(config.bug_threshold)?;
        let drivers = layout.drivers.clone();
        if let (Some(fcount), Some(driver)) = (self.fail_shot_at, drivers.get(&ids::MOTION)) {
            driver.fail_shot_at(fcount);
        }

        let scheduler = Scheduler::new(Arc::new(layout.registry), layout.table, config)?;
        let rx = scheduler.subscribe();
        let mut tally = Tally::default();

        let sensor = scheduler.open_chain(
            SENSOR,
            ids::SENSOR_CHAIN,
            ChainConfig {
                trigger: TriggerMode::FreeRunning,
                shot_timeout_ms: self.timeout_ms,
                run_ahead: 2,
            },
        )?;
        scheduler.open_chain(
            M2M,
            ids::MOTION_CHAIN,
            ChainConfig {
                trigger: TriggerMode::OnDemand,
                shot_timeout_ms: self.timeout_ms,
                run_ahead: 0,
            },
        )?;
        scheduler.registry().set_sensor_position(M2M, 1);
        scheduler.process_start(SENSOR)?;
        scheduler.process_start(M2M)?;
        scheduler.sensor_start(SENSOR)?;

        let sensor_outputs: OutputSet = [ids::FRONT_CAPTURE, ids::FRONT_STATS, ids::TONE_OUT, ids::SCALER_PREVIEW]
            .into_iter()
            .collect();

        for tick in 1..=self.frames {
            // caller skips every 7th frame; the config lock fills the gap
            if tick % 7 != 0 {
                let fcount = match self.late_every {
                    Some(n) if n > 0 && tick % n == 0 => tick.saturating_sub(5),
                    _ => tick,
                };
                scheduler.grp_shot(SENSOR, &FrameTemplate::new(fcount, sensor_outputs).with_rcount(1))?;
            }

            match scheduler.config_lock(SENSOR, tick.saturating_sub(1))? {
                LockOutcome::Dispatched(view) => self.run_sensor_frame(&scheduler, &sensor, &view).await?,
                LockOutcome::Duplicate(fcount) => log::info!("tick {} already covered by [F:{}]", tick, fcount),
                LockOutcome::Ignored => {}
            }

            let buffers = if tick % 5 == 0 { 2 } else { 1 };
            let planes = (0..buffers).map(|i| PlaneBuffer { dva: 0x8000_0000 + i * 0x10_0000, kva: 0 }).collect();
            let template = FrameTemplate::new(tick, OutputSet::single(ids::MOTION_OUT))
                .with_planes(planes)
                .with_buffers(buffers as u32);
            if let Err(e) = scheduler.grp_shot(M2M, &template) {
                log::warn!("motion frame [F:{}] not dispatched: {}", tick, e);
            }
            service_m2m(&scheduler).await?;

            tally.drain(&rx);
        }

        scheduler.sensor_stop(SENSOR).await?;
        scheduler.process_stop(SENSOR, false).await?;
        scheduler.process_stop(M2M, false).await?;
        scheduler.close_chain(SENSOR)?;
        scheduler.close_chain(M2M)?;
        tally.drain(&rx);

        Ok(Report {
            statistics: scheduler.statistics(),
            notifications: tally,
            drivers: layout_names(&scheduler, &drivers),
        })
    }

    async fn run_sensor_frame(&self, scheduler: &Scheduler, chain: &StageChain, view: &FrameView) -> Result<()> {
        for stage in chain.head_to_tail() {
            match scheduler.frame_start(stage.id(), SENSOR)? {
                StartOutcome::Started(started) => log::debug!("sensor [F:{}] started", started.fcount),
                StartOutcome::Duplicate(_) | StartOutcome::Follower => {}
            }
        }

        if self.stall_at == Some(view.fcount) {
            log::info!("withholding completion of [F:{}]", view.fcount);
            tokio::time::sleep(Duration::from_millis(self.timeout_ms * 2)).await;
            return Ok(());
        }

        // the front end raises frame end for every frame, internal ones included
        let leader = chain.leader().id();
        let mut events = vec![DoneEvent::core(leader, SENSOR).with_frame(view.handle)];

        let leader_output = chain.leader_output();
        for stage in chain.tail_to_head() {
            if stage.id() != leader && view.core_flag.contains(stage.id()) {
                events.push(DoneEvent::core(stage.id(), SENSOR).with_frame(view.handle));
            }
            if !stage.outputs().intersection(&view.out_flag).without(leader_output).is_empty() {
                events.push(DoneEvent::outputs(stage.id(), SENSOR).with_frame(view.handle));
            }
        }
        if let Some(rng) = &self.shuffle {
            rng.lock().shuffle(&mut events);
        }

        for event in events {
            scheduler.frame_done(event)?;
        }
        Ok(())
    }
}

/// Start and complete whatever the motion chain has dispatched, giving the
/// multi-shot worker a chance to issue the next replica
async fn service_m2m(scheduler: &Scheduler) -> Result<()> {
    let chain = scheduler.chain(M2M)?;
    for _ in 0..32 {
        let queue = chain.queue();
        if queue.len(FrameState::Configured) > 0 {
            if let StartOutcome::Started(view) = scheduler.frame_start(ids::MOTION, M2M)? {
                scheduler.frame_done(DoneEvent::outputs(ids::MOTION, M2M).with_frame(view.handle))?;
            }
        } else if queue.len(FrameState::Requested) > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        } else {
            break;
        }
    }
    Ok(())
}

fn layout_names(
    scheduler: &Scheduler,
    drivers: &std::collections::BTreeMap<rayos_ischain::StageId, rayos_ischain::stages::BlockDriver>,
) -> Vec<(String, rayos_ischain::stages::DriverSnapshot)> {
    drivers
        .iter()
        .filter_map(|(id, driver)| {
            let name = scheduler.registry().stage(*id).ok()?.name().to_string();
            Some((name, driver.snapshot()))
        })
        .collect()
}
