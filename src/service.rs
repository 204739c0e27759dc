//! Service lifecycle: one capture thread per device, a worker thread that
//! drains the opcode queue into the encounter engine, and a reschedulable
//! idle-timer thread. Shutdown rides on dropping the shutdown channel plus
//! a cancellation flag the capture threads poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::config::SettingsHandle;
use crate::errors::MeterError;
use crate::events::{EventBus, MeterEvent};
use crate::player_cache::PlayerCache;
use crate::protocol::types::OpcodeRecord;
use crate::services::capture::{self, CaptureStats, PacketRouter};
use crate::services::encounter::EncounterEngine;

// How long the timer thread parks when no deadline is armed.
const TIMER_PARK: Duration = Duration::from_secs(3600);

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct MeterService {
    engine: Arc<Mutex<EncounterEngine>>,
    bus: Arc<EventBus>,
    player_cache: Arc<PlayerCache>,
    stats: Arc<CaptureStats>,
    cancel: Arc<AtomicBool>,
    shutdown_tx: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl MeterService {
    /// Open capture devices and spin up the pipeline. Fails only when no
    /// device at all could be opened.
    pub fn start(settings: Arc<SettingsHandle>) -> Result<Self, MeterError> {
        let config = settings.get();
        let bus = Arc::new(EventBus::new());
        let player_cache = Arc::new(PlayerCache::new());
        let stats = Arc::new(CaptureStats::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();
        let (opcode_tx, opcode_rx) = unbounded::<OpcodeRecord>();
        let (timer_tx, timer_rx) = unbounded::<i64>();

        let engine = Arc::new(Mutex::new(EncounterEngine::new(
            player_cache.clone(),
            bus.clone(),
            timer_tx,
            &config,
        )));

        // Open everything up front so a total failure surfaces before any
        // thread exists. A single bad device is logged and skipped.
        let devices = capture::usable_devices(&config.network_interface)?;
        let mut captures = Vec::new();
        for device in devices {
            let name = device.name.clone();
            match capture::open_device(device) {
                Ok(cap) => captures.push((name, cap)),
                Err(e) => log::warn!("skipping device: {e}"),
            }
        }
        if captures.is_empty() {
            return Err(MeterError::TransportUnavailable);
        }

        let router = Arc::new(Mutex::new(PacketRouter::new(opcode_tx, stats.clone())));
        let mut threads = Vec::new();
        for (name, cap) in captures {
            let router = router.clone();
            let cancel = cancel.clone();
            threads.push(thread::spawn(move || {
                capture::run_capture_loop(&name, cap, router, cancel)
            }));
        }

        {
            let engine = engine.clone();
            let settings_rx = settings.watch();
            let shutdown_rx = shutdown_rx.clone();
            threads.push(thread::spawn(move || {
                run_engine_worker(opcode_rx, settings_rx, shutdown_rx, engine)
            }));
        }

        {
            let engine = engine.clone();
            let shutdown_rx = shutdown_rx.clone();
            threads.push(thread::spawn(move || {
                run_idle_timer(timer_rx, shutdown_rx, engine)
            }));
        }

        Ok(Self {
            engine,
            bus,
            player_cache,
            stats,
            cancel,
            shutdown_tx: Some(shutdown_tx),
            threads,
        })
    }

    pub fn subscribe(&self) -> Receiver<MeterEvent> {
        self.bus.subscribe()
    }

    pub fn engine(&self) -> &Arc<Mutex<EncounterEngine>> {
        &self.engine
    }

    pub fn player_cache(&self) -> &Arc<PlayerCache> {
        &self.player_cache
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }

    pub fn select_encounter(&self, index: Option<usize>) {
        self.engine.lock().unwrap().select_encounter(index, now_ms());
    }

    /// Stop capture, drain workers and join every thread.
    pub fn stop(mut self) {
        log::info!("meter service shutting down");
        self.cancel.store(true, Ordering::Relaxed);
        self.shutdown_tx.take(); // dropping it disconnects every waiter
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.stats.log_summary();
    }
}

fn run_engine_worker(
    opcodes: Receiver<OpcodeRecord>,
    settings: Receiver<crate::config::MeterConfig>,
    shutdown: Receiver<()>,
    engine: Arc<Mutex<EncounterEngine>>,
) {
    loop {
        crossbeam_channel::select! {
            recv(opcodes) -> msg => match msg {
                Ok(record) => engine.lock().unwrap().handle_record(&record, now_ms()),
                Err(_) => break,
            },
            recv(settings) -> msg => match msg {
                Ok(config) => engine.lock().unwrap().apply_settings(&config, now_ms()),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
    log::debug!("engine worker stopped");
}

/// Reschedulable one-shot: the engine sends absolute deadlines; the thread
/// sleeps toward the latest one and asks the engine whether the quiet
/// period really elapsed, re-arming when it has not.
fn run_idle_timer(
    deadlines: Receiver<i64>,
    shutdown: Receiver<()>,
    engine: Arc<Mutex<EncounterEngine>>,
) {
    let mut deadline: Option<i64> = None;
    loop {
        let wait = match deadline {
            Some(d) => Duration::from_millis((d - now_ms()).max(0) as u64),
            None => TIMER_PARK,
        };
        crossbeam_channel::select! {
            recv(deadlines) -> msg => match msg {
                Ok(d) => deadline = Some(d),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
            default(wait) => {
                if deadline.take().is_some() {
                    deadline = engine.lock().unwrap().on_idle_timeout(now_ms());
                }
            }
        }
    }
    log::debug!("idle timer stopped");
}
