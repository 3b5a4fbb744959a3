//! Long-running stress test for corral state.
//!
//! Each cycle adds an application, has concurrent threads add and assign
//! units to new machines, destroys every unit from two threads at once,
//! then tears down the machines and the application. After every cycle the
//! model must be empty again; with the file backend the store must also
//! pass integrity verification with no WAL entries left behind.
//!
//! Usage:
//!   cargo run --bin stress_test -- [--cycles N] [--threads N] [--backend file]

use clap::{Parser, ValueEnum};
use corral_core::{AddApplicationArgs, AgentLiving, AssignmentPolicy, Life, Living, State, Status};
use corral_schema::StateConfig;
use corral_store::{verify_store_integrity, StoreLayout};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Memory,
    File,
}

#[derive(Parser)]
#[command(name = "stress_test", about = "Concurrent assign/destroy cycles against corral state")]
struct Cli {
    /// Number of cycles to run.
    #[arg(long, default_value_t = 100)]
    cycles: usize,

    /// Units (and threads) per cycle.
    #[arg(long, default_value_t = 8)]
    threads: usize,

    #[arg(long, value_enum, default_value_t = Backend::Memory)]
    backend: Backend,

    /// Log lifecycle transitions.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Default)]
struct Timings {
    assign: Duration,
    destroy: Duration,
    teardown: Duration,
}

fn count_files_in(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(Result::ok)
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

fn assign_phase(st: &Arc<State>, app: &str, threads: usize) -> Result<Vec<String>, String> {
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let st = Arc::clone(st);
            let barrier = Arc::clone(&barrier);
            let app = app.to_owned();
            thread::spawn(move || -> Result<String, String> {
                let mut application = st.application(&app).map_err(|e| e.to_string())?;
                let mut unit = application.add_unit().map_err(|e| e.to_string())?;
                if i % 2 == 1 {
                    // Half the agents report, so destroy takes the long path.
                    unit.set_agent_status(Status::Idle, "ready")
                        .map_err(|e| e.to_string())?;
                }
                barrier.wait();
                st.assign_unit(&mut unit, AssignmentPolicy::AssignNew)
                    .map_err(|e| format!("assign {}: {e}", unit.name()))?;
                Ok(unit.name().to_string())
            })
        })
        .collect();

    let mut names = Vec::new();
    for h in handles {
        names.push(h.join().map_err(|_| "assign thread panicked".to_owned())??);
    }

    let machines = st.all_machines().map_err(|e| e.to_string())?;
    if machines.len() != threads {
        return Err(format!("{} machines for {threads} units", machines.len()));
    }
    if let Some(m) = machines.iter().find(|m| m.principals().len() != 1) {
        return Err(format!("machine {} hosts {:?}", m.id(), m.principals()));
    }
    Ok(names)
}

fn destroy_phase(st: &Arc<State>, units: &[String]) -> Result<(), String> {
    let barrier = Arc::new(Barrier::new(units.len() * 2));
    let handles: Vec<_> = units
        .iter()
        .flat_map(|name| [name.clone(), name.clone()])
        .map(|name| {
            let st = Arc::clone(st);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<(), String> {
                let unit = st.unit(&name);
                barrier.wait();
                match unit {
                    Ok(mut unit) => unit.destroy().map_err(|e| format!("destroy {name}: {e}")),
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e.to_string()),
                }
            })
        })
        .collect();
    for h in handles {
        h.join().map_err(|_| "destroy thread panicked".to_owned())??;
    }

    for name in units {
        match st.unit(name) {
            Ok(mut unit) => {
                if unit.life() == Life::Alive {
                    return Err(format!("unit {name} still alive after destroy"));
                }
                unit.ensure_dead().map_err(|e| e.to_string())?;
                unit.remove().map_err(|e| e.to_string())?;
                unit.remove().map_err(|e| format!("second remove of {name}: {e}"))?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}

fn teardown_phase(st: &Arc<State>, app: &str) -> Result<(), String> {
    for mut machine in st.all_machines().map_err(|e| e.to_string())? {
        if machine.life() == Life::Alive {
            return Err(format!("machine {} did not follow its last unit", machine.id()));
        }
        machine.ensure_dead().map_err(|e| e.to_string())?;
        machine.remove().map_err(|e| e.to_string())?;
    }
    let mut application = st.application(app).map_err(|e| e.to_string())?;
    application.destroy().map_err(|e| e.to_string())?;
    if st.application(app).is_ok() {
        return Err(format!("application {app} survived destroy with no units"));
    }
    Ok(())
}

fn run_cycle(
    st: &Arc<State>,
    threads: usize,
    cycle: usize,
    timings: &mut Timings,
) -> Result<(), String> {
    let app = format!("app{cycle}");
    st.add_application(AddApplicationArgs {
        name: app.clone(),
        series: "jammy".to_owned(),
        ..Default::default()
    })
    .map_err(|e| format!("cycle {cycle}: ADD APPLICATION FAILED: {e}"))?;

    let t0 = Instant::now();
    let units = assign_phase(st, &app, threads)
        .map_err(|e| format!("cycle {cycle}: ASSIGN FAILED: {e}"))?;
    timings.assign += t0.elapsed();

    let t0 = Instant::now();
    destroy_phase(st, &units).map_err(|e| format!("cycle {cycle}: DESTROY FAILED: {e}"))?;
    timings.destroy += t0.elapsed();

    let t0 = Instant::now();
    teardown_phase(st, &app).map_err(|e| format!("cycle {cycle}: TEARDOWN FAILED: {e}"))?;
    timings.teardown += t0.elapsed();
    Ok(())
}

fn check_health(st: &Arc<State>, layout: Option<&StoreLayout>, cycle: usize) -> u64 {
    let mut failures = 0u64;
    let leftovers = [
        ("units", st.all_units().map(|v| v.len())),
        ("machines", st.all_machines().map(|v| v.len())),
        ("applications", st.all_applications().map(|v| v.len())),
    ];
    for (kind, count) in leftovers {
        match count {
            Ok(0) => {}
            Ok(n) => {
                eprintln!("  cycle {cycle}: LEAK: {n} {kind} remaining");
                failures += 1;
            }
            Err(e) => {
                eprintln!("  cycle {cycle}: QUERY ERROR: {e}");
                failures += 1;
            }
        }
    }
    let Some(layout) = layout else {
        return failures;
    };
    match verify_store_integrity(layout) {
        Ok(report) => {
            if !report.failed.is_empty() {
                eprintln!(
                    "  cycle {cycle}: INTEGRITY FAILURE: {} documents failed",
                    report.failed.len()
                );
                failures += 1;
            }
        }
        Err(e) => {
            eprintln!("  cycle {cycle}: INTEGRITY CHECK ERROR: {e}");
            failures += 1;
        }
    }
    let wal_files = count_files_in(&layout.wal_dir());
    if wal_files > 0 {
        eprintln!("  cycle {cycle}: WAL LEAK: {wal_files} stale entries");
        failures += 1;
    }
    failures
}

fn print_report(cycles: usize, failures: u64, timings: &Timings, layout: Option<&StoreLayout>) {
    println!();
    println!("============================================");
    println!("Results: {cycles} cycles, {failures} failures");
    for (label, total) in [
        ("assign", timings.assign),
        ("destroy", timings.destroy),
        ("teardown", timings.teardown),
    ] {
        println!(
            "  {label:<9}{:.3}s total, {:.3}ms avg",
            total.as_secs_f64(),
            total.as_secs_f64() * 1000.0 / cycles.max(1) as f64
        );
    }
    let mut wal_files = 0;
    if let Some(layout) = layout {
        wal_files = count_files_in(&layout.wal_dir());
        println!("  WAL entries remaining: {wal_files}");
        match verify_store_integrity(layout) {
            Ok(report) => println!(
                "  integrity: {} checked, {} passed, {} failed",
                report.checked,
                report.passed,
                report.failed.len()
            ),
            Err(e) => println!("  integrity: ERROR: {e}"),
        }
    }

    if failures > 0 || wal_files > 0 {
        eprintln!("\nSTRESS TEST FAILED");
        std::process::exit(1);
    } else {
        println!("\nSTRESS TEST PASSED");
    }
}

fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CORRAL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    println!(
        "corral stress test: {} cycles, {} threads, {:?} backend",
        cli.cycles, cli.threads, cli.backend
    );
    println!("============================================");

    let store_dir = tempfile::tempdir().expect("create temp dir");
    let mut config = StateConfig::default();
    // Double destroys and concurrent assignment contend on shared documents.
    config.txn.max_attempts = 10;
    let layout = match cli.backend {
        Backend::Memory => None,
        Backend::File => {
            config.store.backend = "file".to_owned();
            config.store.path = Some(store_dir.path().to_path_buf());
            Some(StoreLayout::new(store_dir.path()))
        }
    };
    let st = State::builder("stress-model")
        .config(config)
        .open()
        .expect("open state");

    let mut timings = Timings::default();
    let mut failures = 0u64;
    for cycle in 1..=cli.cycles {
        if let Err(msg) = run_cycle(&st, cli.threads.max(1), cycle, &mut timings) {
            eprintln!("  {msg}");
            failures += 1;
            continue;
        }
        if cycle % 10 == 0 {
            failures += check_health(&st, layout.as_ref(), cycle);
        }
        if cycle % 50 == 0 {
            let elapsed = timings.assign + timings.destroy + timings.teardown;
            println!(
                "  cycle {cycle}/{}: {:.1}s elapsed, {failures} failures",
                cli.cycles,
                elapsed.as_secs_f64()
            );
        }
    }
    failures += check_health(&st, layout.as_ref(), cli.cycles);
    st.close();

    print_report(cli.cycles, failures, &timings, layout.as_ref());
}
