use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::Receiver;

use resonance_meter::services::capture;
use resonance_meter::{load_config, EncounterSnapshot, MeterEvent, MeterService, SettingsHandle};

#[derive(Parser)]
#[command(version, about = "Passive combat meter: capture, decode, aggregate")]
struct Cli {
    /// Path to the JSON config file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Capture only on this pcap device (default: all suitable devices)
    #[arg(long)]
    interface: Option<String>,

    /// Override the encounter idle timeout in seconds (0 = never auto-end)
    #[arg(long)]
    reset_timer: Option<u32>,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,
}

fn main() {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config);
    if let Some(interface) = cli.interface {
        config.network_interface = interface;
    }
    if let Some(seconds) = cli.reset_timer {
        config.encounter_reset_timer_seconds = seconds;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    if cli.list_devices {
        match capture::usable_devices("") {
            Ok(devices) => {
                for device in devices {
                    println!("{}\t{}", device.name, device.desc.unwrap_or_default());
                }
            }
            Err(e) => eprintln!("{e}"),
        }
        return;
    }

    let settings = Arc::new(SettingsHandle::new(config));
    let service = match MeterService::start(settings.clone()) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("fatal: {e}");
            eprintln!("raw packet capture needs administrator/root privileges");
            std::process::exit(1);
        }
    };

    let events = service.subscribe();
    let printer = thread::spawn(move || run_table_printer(events));

    println!("meter running; commands: history | select <n|live> | timer <secs> | keep <n> | quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("quit") | Some("exit") => break,
            Some("history") => print_history(&service),
            Some("select") => match parts.next() {
                Some("live") => service.select_encounter(None),
                Some(index) => match index.parse::<usize>() {
                    Ok(i) => service.select_encounter(Some(i)),
                    Err(_) => println!("usage: select <n|live>"),
                },
                None => println!("usage: select <n|live>"),
            },
            Some("timer") => match parts.next().and_then(|v| v.parse::<u32>().ok()) {
                Some(seconds) => {
                    let mut cfg = settings.get();
                    cfg.encounter_reset_timer_seconds = seconds;
                    settings.update(cfg);
                    println!("idle timeout set to {seconds}s");
                }
                None => println!("usage: timer <seconds>"),
            },
            Some("keep") => match parts.next().and_then(|v| v.parse::<u32>().ok()) {
                Some(count) => {
                    let mut cfg = settings.get();
                    cfg.max_encounter_history = count;
                    settings.update(cfg);
                    println!("history bound set to {count}");
                }
                None => println!("usage: keep <count>"),
            },
            _ => println!("commands: history | select <n|live> | timer <secs> | keep <n> | quit"),
        }
    }

    service.stop();
    let _ = printer.join();
}

fn print_history(service: &MeterService) {
    let engine = service.engine().lock().unwrap();
    let history = engine.history();
    if history.is_empty() {
        println!("no completed encounters");
        return;
    }
    for (i, encounter) in history.iter().enumerate() {
        let snapshot = encounter.snapshot(encounter.last_activity_ms);
        println!(
            "{:2}. {} | {:>6.1}s | {} dmg | {} attackers",
            i,
            format_start(snapshot.start_ms),
            snapshot.duration_ms as f64 / 1000.0,
            snapshot.total_damage,
            snapshot.rows.len(),
        );
    }
}

/// Console subscriber: renders the attacker table on encounter events,
/// throttling the high-frequency updates.
fn run_table_printer(events: Receiver<MeterEvent>) {
    let mut last_print = Instant::now() - Duration::from_secs(10);
    for event in events.iter() {
        match event {
            MeterEvent::ServerChange => println!("-- server changed --"),
            MeterEvent::EncounterStarted(snapshot) => {
                println!("-- encounter started at {} --", format_start(snapshot.start_ms));
            }
            MeterEvent::EncounterUpdated(snapshot) => {
                if last_print.elapsed() >= Duration::from_secs(1) {
                    print_snapshot(&snapshot);
                    last_print = Instant::now();
                }
            }
            MeterEvent::EncounterEnded(snapshot) => {
                println!("-- encounter ended --");
                print_snapshot(&snapshot);
                last_print = Instant::now();
            }
            MeterEvent::HistoryChanged => println!("-- history updated --"),
            MeterEvent::SelectedEncounterChanged(Some(snapshot)) => {
                println!("-- selected encounter --");
                print_snapshot(&snapshot);
            }
            MeterEvent::SelectedEncounterChanged(None) => {
                println!("-- selection cleared --");
            }
        }
    }
}

fn print_snapshot(snapshot: &EncounterSnapshot) {
    println!(
        "=== {} | {:>6.1}s | {} dmg{} ===",
        format_start(snapshot.start_ms),
        snapshot.duration_ms as f64 / 1000.0,
        snapshot.total_damage,
        if snapshot.is_active { "" } else { " (ended)" },
    );
    for (rank, row) in snapshot.rows.iter().enumerate() {
        let class = row
            .class_id
            .and_then(resonance_meter::skill_table::class_name)
            .unwrap_or("?");
        let spec = row.spec_name.as_deref().unwrap_or("?");
        println!(
            "{:2}. {:<20} [{}/{}] {:>10} dmg {:>8} dps  {:>4}/{:<4} crit  {:>8} heal",
            rank + 1,
            row.name,
            class,
            spec,
            row.total_damage,
            row.dps,
            row.crit_count,
            row.damage_count,
            row.healing_done,
        );
    }
}

fn format_start(start_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(start_ms)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| start_ms.to_string())
}
