use std::env;
use std::process;

use relaydns::config::DaemonConfig;
use relaydns::dns::context::Daemon;
use relaydns::dns::daemon;

fn main() {
    simple_logger::init().expect("failed to initialize logger");

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let config = match DaemonConfig::from_args(&args[1..]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!();
            print!("{}", DaemonConfig::usage(&program));
            process::exit(2);
        }
    };

    log::info!(
        "relaydnsd starting: {} upstream(s), forward_timeout={}s, retry_interval={}s, max_sockets={}",
        config.servers.len(),
        config.forward_timeout,
        config.retry_interval,
        config.max_sockets,
    );

    let server = match Daemon::new(&config) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = daemon::run(server) {
        log::error!("event loop exited with an error: {}", e);
        process::exit(1);
    }
}
