use std::{error::Error, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use log::{error, info};
use roosty_alarm::{
    clock::SystemClock,
    config::Config,
    hardware::DesktopHardware,
    recovery,
    terminal::TerminalPresenter,
    timer::{PermissionFlag, PermissionGate},
    AlarmStore, AlertController, Scheduler, TimerThread,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// config file to use instead of the one in the config directory
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// write the default config
    Init {
        #[clap(long, short)]
        force: bool,
    },
    /// print the saved alarms
    List,
    /// restore saved alarms and ring them when they are due (the default)
    ///
    /// the daemon only arms what is saved when it starts. it takes no new
    /// alarms while running: alarms set or cancelled by another process through
    /// the library are picked up by the next `run`
    Run,
}

fn main() -> Result<(), Box<dyn Error>> {
    // initilize the logger
    if let Err(err) = simple_file_logger::init_logger!("roosty_alarm") {
        eprintln!("couldn't initialize logger: {err:?}");
    }

    let args = Args::parse();
    let config_path = match args.config {
        Some(path) => path,
        None => Config::config_path()?,
    };
    match args.command {
        Some(Command::Init { force }) => {
            if force || !config_path.exists() {
                Config::new().save(&config_path)?;
                println!("wrote {}", config_path.display());
            } else {
                println!("{} already exists, use --force to overwrite", config_path.display());
            }
            Ok(())
        }
        Some(Command::List) => list(&Config::load_or_default(&config_path)?),
        Some(Command::Run) | None => run(&Config::load_or_default(&config_path)?),
    }
}

fn list(config: &Config) -> Result<(), Box<dyn Error>> {
    let store = AlarmStore::open(config.store_path()?);
    let alarms = store.list_all()?;
    if alarms.is_empty() {
        println!("no alarms");
    }
    for alarm in alarms {
        println!("{alarm} [{}] {}", alarm.habit_id, alarm.body);
    }
    Ok(())
}

fn run(config: &Config) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(AlarmStore::open(config.store_path()?));
    let (events, wake_events) = crossbeam_channel::unbounded();
    let timers = Arc::new(TimerThread::spawn(events)?);
    let gateway = PermissionGate::new(
        &timers,
        config.inexact_window(),
        PermissionFlag::new(config.exact_alarms),
    );
    let scheduler = Arc::new(
        Scheduler::new(store, gateway, Arc::new(SystemClock))
            .with_fallbacks(config.fallbacks())
            .with_fallback(config.fallback()),
    );

    recovery::sweep(&scheduler);

    let controller = Arc::new(
        AlertController::new(
            Arc::clone(&scheduler),
            Arc::new(DesktopHardware::new(config.sound.clone())),
            Arc::new(TerminalPresenter::spawn()?),
        )
        .with_wake_hold(config.wake_hold())
        .with_vibration_pattern(config.vibration_pattern.clone()),
    );
    info!("waiting for alarms");

    for event in &wake_events {
        if let Err(err) = controller.spawn_delivery(event.clone()) {
            // ring on this thread rather than lose the alarm
            error!("couldn't start a thread for alarm {}: {err}", event.alarm.id);
            controller.deliver(event);
        }
    }
    Ok(())
}
