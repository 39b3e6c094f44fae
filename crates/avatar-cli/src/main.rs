//! `avatar-cli` – headless avatar session
//!
//! The `avatar-sim` binary drives one [`LocalAvatar`] through a scripted
//! session against a [`SimWorld`]:
//!
//! 1. Loads `~/.avatar/config.toml` (writing the defaults on first run).
//! 2. Builds a floor, an optional low step and an optional wall.
//! 3. Runs stand → walk → jump → fly → sit → go-home phases with a synthetic
//!    HMD and prints a per-phase summary.
//! 4. Stops at the next tick boundary on **Ctrl-C**.

mod config;

use colored::Colorize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use avatar_middleware::{EventBus, Topic, TopicReceiver};
use avatar_perception::SharedInput;
use avatar_physics::SimWorld;
use avatar_runtime::{AvatarHandle, BusRig, LocalAvatar, TickReport, init_tracing};
use avatar_types::{Action, AvatarError, CharacterState, DriveKeys, EventPayload, SensorPose};
use glam::{Quat, Vec3};

/// Seated head height as a fraction of the standing eye height.
const SEATED_HEAD_FRACTION: f32 = 0.5;

fn main() {
    let _tracing = init_tracing("avatar-sim");
    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping after this tick …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the session can only run to completion");
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&config::Config::default()) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    match run_session(&cfg, &shutdown) {
        Ok(()) => println!("\n  {}\n", "Session complete.".green().bold()),
        Err(e) => {
            println!("\n  {}: {}\n", "Session failed".red().bold(), e);
            std::process::exit(1);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

fn build_world(cfg: &config::Config) -> SimWorld {
    let mut world = SimWorld::new().with_floor(0.0);
    if cfg.with_step {
        world = world.with_box(Vec3::new(-2.0, 0.0, -4.0), Vec3::new(2.0, 0.15, -3.0));
    }
    if cfg.with_wall {
        world = world.with_box(Vec3::new(-3.0, 0.0, -9.0), Vec3::new(3.0, 3.0, -8.5));
    }
    world
}

/// One scripted stretch of the session.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Stand,
    Walk,
    Jump,
    Fly,
    Sit,
    GoHome,
}

impl Phase {
    const ALL: [Phase; 6] = [Phase::Stand, Phase::Walk, Phase::Jump, Phase::Fly, Phase::Sit, Phase::GoHome];

    fn name(self) -> &'static str {
        match self {
            Phase::Stand => "stand",
            Phase::Walk => "walk",
            Phase::Jump => "jump",
            Phase::Fly => "fly",
            Phase::Sit => "sit",
            Phase::GoHome => "go home",
        }
    }
}

#[derive(Debug, Default)]
struct PhaseSummary {
    ticks: u32,
    start: Vec3,
    end: Vec3,
    states: BTreeSet<String>,
    sitting: bool,
    events: usize,
    alerts: usize,
}

struct Session {
    avatar: LocalAvatar<SimWorld>,
    input: SharedInput,
    handle: AvatarHandle,
    locomotion: TopicReceiver,
    alerts: TopicReceiver,
    dt: f32,
    standing_eye: f32,
}

fn run_session(cfg: &config::Config, shutdown: &AtomicBool) -> Result<(), AvatarError> {
    let bus = EventBus::default();
    let input = SharedInput::new();
    let avatar = LocalAvatar::new(
        cfg.avatar.clone(),
        Arc::new(input.clone()),
        build_world(cfg),
        Box::new(BusRig::new(bus.clone())),
        bus.clone(),
    )?;
    let mut session = Session {
        handle: avatar.handle(),
        locomotion: bus.subscribe_to(Topic::Locomotion),
        alerts: bus.subscribe_to(Topic::SystemAlerts),
        standing_eye: cfg.avatar.user_eye_height(),
        avatar,
        input,
        dt: cfg.tick_length(),
    };
    info!(id = %session.avatar.id(), hz = cfg.tick_hz, "session started");

    println!();
    for phase in Phase::ALL {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let ticks = match phase {
            // sitting needs the head to stay low past the detection timeout
            Phase::Sit => cfg
                .ticks_per_phase
                .max(((cfg.avatar.sit_stand.sitting_timeout + 1.0) * cfg.tick_hz).ceil() as u32),
            _ => cfg.ticks_per_phase,
        };
        let summary = session.run_phase(phase, ticks, shutdown)?;
        print_summary(phase, &summary);
    }
    Ok(())
}

impl Session {
    fn head(&self, height: f32) -> SensorPose {
        SensorPose::new(Vec3::new(0.0, height, 0.0), Quat::IDENTITY)
    }

    fn drive(&self, keys: DriveKeys) {
        self.input.set_drive_keys(keys);
    }

    fn run_phase(&mut self, phase: Phase, ticks: u32, shutdown: &AtomicBool) -> Result<PhaseSummary, AvatarError> {
        self.input.submit_pose(Action::Head, self.head(self.standing_eye));
        self.drive(DriveKeys::default());
        match phase {
            Phase::Stand => {}
            Phase::Walk => self.drive(DriveKeys {
                translate_z: 1.0,
                ..DriveKeys::default()
            }),
            Phase::Jump => self.handle.jump()?,
            Phase::Fly => {
                self.handle.set_flying(true)?;
                self.drive(DriveKeys {
                    translate_y: 1.0,
                    ..DriveKeys::default()
                });
            }
            Phase::Sit => self
                .input
                .submit_pose(Action::Head, self.head(self.standing_eye * SEATED_HEAD_FRACTION)),
            Phase::GoHome => self.handle.go_home()?,
        }

        let mut summary = PhaseSummary {
            start: self.avatar.position(),
            end: self.avatar.position(),
            ..PhaseSummary::default()
        };
        for _ in 0..ticks {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let report = self.avatar.update(self.dt)?;
            self.record(&mut summary, &report);
        }

        if phase == Phase::Fly {
            self.handle.set_flying(false)?;
        }
        Ok(summary)
    }

    fn record(&mut self, summary: &mut PhaseSummary, report: &TickReport) {
        summary.ticks += 1;
        summary.end = report.position;
        summary.states.insert(state_name(report.state).to_string());
        summary.sitting = report.sitting;
        for event in self.locomotion.drain() {
            if let EventPayload::StateChanged { from, to } = event.payload {
                info!(from = state_name(from), to = state_name(to), "state changed");
            }
            summary.events += 1;
        }
        summary.alerts += self.alerts.drain().len();
    }
}

fn state_name(state: CharacterState) -> &'static str {
    match state {
        CharacterState::Ground => "ground",
        CharacterState::Takeoff => "takeoff",
        CharacterState::InAir => "in-air",
        CharacterState::Hover => "hover",
        CharacterState::Seated => "seated",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_summary(phase: Phase, summary: &PhaseSummary) {
    let moved = summary.end - summary.start;
    let states: Vec<&str> = summary.states.iter().map(String::as_str).collect();
    println!("  {} {}", "▶".cyan().bold(), phase.name().bold());
    println!("    ticks      {}", summary.ticks);
    println!(
        "    position   ({:.2}, {:.2}, {:.2}) {}",
        summary.end.x,
        summary.end.y,
        summary.end.z,
        format!("moved {:.2} m", moved.length()).dimmed()
    );
    println!("    states     {}", states.join(" → ").yellow());
    println!(
        "    posture    {}",
        if summary.sitting { "sitting".magenta() } else { "standing".green() }
    );
    println!("    events     {} locomotion, {} alerts", summary.events, summary.alerts);
}

fn print_banner() {
    println!();
    println!("  {} {}", "avatar-sim".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Headless avatar locomotion session");
    println!();
}
