//! Plugin server process entry point.
//!
//! Spawned by the host either as `bridge` (attach to a shared region and
//! serve it until the host quits or dies) or as `probe` (load one plugin in
//! a throwaway process and report what it is).

use std::path::Path;
use std::process::ExitCode;

use soundproof_server::{probe, Server};

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("bridge") if args.len() == 4 => run_bridge(&args[2], &args[3]),
        Some("probe") if args.len() == 5 => run_probe(&args[2], &args[3], &args[4]),
        _ => usage(&args),
    }
}

fn run_bridge(parent: &str, region: &str) -> ExitCode {
    let Ok(parent_pid) = parent.parse::<u32>() else {
        eprintln!("invalid parent pid '{parent}'");
        return ExitCode::from(2);
    };
    tracing::info!(parent = parent_pid, region, "bridge starting");

    let mut server = match Server::attach(Path::new(region)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "could not attach to region");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.spawn_parent_watch(parent_pid) {
        tracing::error!(error = %e, "could not watch parent");
        return ExitCode::FAILURE;
    }
    match server.run() {
        Ok(()) => {
            tracing::info!("bridge shut down");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "bridge failed");
            ExitCode::FAILURE
        }
    }
}

fn run_probe(path: &str, id: &str, result_file: &str) -> ExitCode {
    let unique_id = if id == "_" {
        None
    } else {
        match id.parse::<i32>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                eprintln!("invalid plugin id '{id}', expected an integer or '_'");
                return ExitCode::from(2);
            }
        }
    };
    match probe::run_probe(path, unique_id, Path::new(result_file)) {
        Ok(report) => {
            tracing::info!(
                name = %report.descriptor.name,
                params = report.parameter_count,
                "probe succeeded"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "probe failed");
            ExitCode::FAILURE
        }
    }
}

fn usage(args: &[String]) -> ExitCode {
    let program = args.first().map(String::as_str).unwrap_or("soundproof-host");
    eprintln!("usage: {program} bridge <parent_pid> <shm_path>");
    eprintln!("       {program} probe <plugin_path> <plugin_id|_> <result_file>");
    ExitCode::from(2)
}
