#![allow(unknown_lints)]

extern crate chan_signal;
extern crate chrono;
extern crate fern;
extern crate tally;

#[macro_use]
extern crate log;

use chan_signal::Signal;
use chrono::Utc;
use std::process;
use tally::agent::Agent;
use tally::registry::Registry;

fn main() {
    let args = match tally::config::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("tally: {}", e);
            process::exit(1);
        }
    };

    let level = match args.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    // Signals must be registered before any thread is spawned so that every
    // thread inherits the mask.
    let signal = chan_signal::notify(&[Signal::INT, Signal::TERM, Signal::USR1]);

    let logging = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                record.module_path().unwrap_or("?"),
                record.line().unwrap_or(0),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply();
    if let Err(e) = logging {
        eprintln!("tally: could not set up logging: {}", e);
        process::exit(1);
    }

    info!("tally - {}", args.version);

    let once = args.once;
    let registry = Registry::builtin();
    let agent = match Agent::new(args, &registry) {
        Ok(agent) => agent,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    if once {
        match agent.once() {
            Ok(report) => {
                if !report.is_clean() {
                    process::exit(2);
                }
                return;
            }
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        }
    }

    let running = match agent.start() {
        Ok(running) => running,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    loop {
        match signal.recv() {
            Some(Signal::USR1) => running.flush_now(),
            Some(sig) => {
                info!("received {:?}, shutting down", sig);
                break;
            }
            None => break,
        }
    }

    let timeout = running.shutdown_timeout();
    let report = running.shutdown(timeout);
    if !report.is_clean() {
        for &(ref name, dropped) in &report.dropped_in_buffers {
            if dropped > 0 {
                warn!("[{}] {} metrics not delivered", name, dropped);
            }
        }
        process::exit(2);
    }
}
