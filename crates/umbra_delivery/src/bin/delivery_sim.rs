//! # Delivery Simulation
//!
//! Connects a crowd of sessions to a few shared worlds, lets them ask for
//! overlapping views, and reports how much preparation work the cache saved.
//!
//! Usage: `delivery_sim [--sessions N] [--seconds S] [--radius R] [--seed N] [--config FILE]`

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use umbra_core::{CellCoord, SessionId, WorldId};
use umbra_delivery::mock::{MockTransform, MockTransport, MockWorld};
use umbra_delivery::{DeliveryConfig, DeliveryServer, WorldProvider};

struct Args {
    sessions: u32,
    seconds: u64,
    radius: i32,
    seed: u64,
    config: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        sessions: 32,
        seconds: 5,
        radius: 4,
        seed: 42,
        config: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(flag) = iter.next() {
        let mut value = || iter.next().ok_or_else(|| format!("missing value for {flag}"));
        match flag.as_str() {
            "--sessions" => args.sessions = value()?.parse().map_err(|e| format!("--sessions: {e}"))?,
            "--seconds" => args.seconds = value()?.parse().map_err(|e| format!("--seconds: {e}"))?,
            "--radius" => args.radius = value()?.parse().map_err(|e| format!("--radius: {e}"))?,
            "--seed" => args.seed = value()?.parse().map_err(|e| format!("--seed: {e}"))?,
            "--config" => args.config = Some(value()?),
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(args)
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let config = match args.config.as_deref().map(DeliveryConfig::load).transpose() {
        Ok(config) => config.unwrap_or_else(|| DeliveryConfig {
            obfuscated_worlds: vec![1],
            ..DeliveryConfig::default()
        }),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║              UMBRA - CELL DELIVERY SIMULATION                    ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();
    println!("┌─ CONFIGURATION ──────────────────────────────────────────────────┐");
    println!("│ Sessions:           {}", args.sessions);
    println!("│ Duration:           {} s", args.seconds);
    println!("│ View Radius:        {} cells", args.radius);
    println!("│ Seed:               {}", args.seed);
    println!("│ Cells per Tick:     {}", config.chunks_per_tick);
    println!("│ Worker Threads:     {}", config.worker_threads);
    println!("│ Tick Rate:          {} Hz", config.tick_rate);
    println!("│ Obfuscated Worlds:  {:?}", config.obfuscated_worlds);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let transport = Arc::new(MockTransport::new());
    let transform = Arc::new(MockTransform::new());
    let mut server = match DeliveryServer::new(config, transport.clone(), Some(transform.clone())) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let worlds: Vec<Arc<dyn WorldProvider>> = (1..=3)
        .map(|id| Arc::new(MockWorld::with_auto_ready(WorldId(id))) as Arc<dyn WorldProvider>)
        .collect();

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut owed = 0usize;
    for index in 0..args.sessions {
        let world = Arc::clone(&worlds[rng.gen_range(0..worlds.len())]);
        let center = CellCoord::new(rng.gen_range(-8..=8), rng.gen_range(-8..=8));
        let view = (-args.radius..=args.radius)
            .flat_map(|dx| (-args.radius..=args.radius).map(move |dz| CellCoord::new(center.x + dx, center.z + dz)))
            .map(|cell| (cell, cell.distance_to(center)));
        owed += server.connect(SessionId(index), world).queue_cells(view);
    }

    println!("Running ({owed} cells owed)...");
    let start = Instant::now();
    let summary = server.run_for(Duration::from_secs(args.seconds));
    let drained = server.flush(Duration::from_secs(10));
    let elapsed = start.elapsed();

    let sent: usize = (0..args.sessions)
        .filter_map(|index| server.session(SessionId(index)))
        .map(|session| session.sent_count())
        .sum();
    let (hits, misses) = server.registry().totals();
    let pool = server.pool().stats();

    println!();
    println!("┌─ TICKS ──────────────────────────────────────────────────────────┐");
    println!("│ Real Time:          {:.2} s", elapsed.as_secs_f64());
    println!("│ Ticks:              {}", summary.ticks);
    println!("│ Avg Tick Time:      {} μs", summary.stats.avg_tick_us());
    println!("│ Max Tick Time:      {} μs", summary.stats.max_tick_us);
    println!("│ Late Ticks:         {}", summary.stats.late_ticks);
    println!("│ Skipped Ticks:      {}", summary.stats.skipped_ticks);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("┌─ DELIVERY ───────────────────────────────────────────────────────┐");
    println!("│ Cells Owed:         {owed}");
    println!("│ Cells Sent:         {sent}");
    println!("│ Transmissions:      {}", transport.transmissions().len());
    println!("│ Failures:           {}", summary.failures.len() + drained.errors.len());
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();
    println!("┌─ CACHE ──────────────────────────────────────────────────────────┐");
    println!("│ Hits:               {hits}");
    println!("│ Misses:             {misses}");
    println!("│ Live Caches:        {}", server.registry().live_caches());
    println!("│ Tasks Submitted:    {}", pool.submitted);
    println!("│ Transform Calls:    {}", transform.calls());
    println!("└──────────────────────────────────────────────────────────────────┘");

    let complete = sent == owed;
    println!();
    if complete {
        println!("✓ Every owed cell delivered");
    } else {
        println!("✗ {} cells still outstanding", owed.saturating_sub(sent));
    }

    server.shutdown();
    if !complete {
        std::process::exit(1);
    }
}
