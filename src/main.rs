use std::sync::Arc;

use log::debug;
use tokio::runtime::Builder;

use wless::config::ServerConfig;
use wless::http_server::Server;

fn print_usage_and_exit(arg0: String) {
    eprintln!("Usage: {} [--threads/-t N]", arg0);
    std::process::exit(1);
}

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;

    while !args.is_empty() && args[0].starts_with('-') {
        if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
                return;
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {}", e);
                    print_usage_and_exit(arg0);
                    return;
                }
            };
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if num_threads == 0 {
        num_threads = std::cmp::max(
            2,
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
        debug!("Runtime threads: {}", num_threads);
    } else {
        println!("Using custom thread count ({})", num_threads);
    }

    let runtime = Builder::new_multi_thread()
        .worker_threads(num_threads)
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    runtime.block_on(async move {
        let config = Arc::new(ServerConfig::load().await);

        let server = match Server::new(config) {
            Ok(server) => server,
            Err(e) => {
                eprintln!("Failed to create server: {}", e);
                std::process::exit(1);
            }
        };

        if let Err(e) = server.run().await {
            eprintln!("Server failed: {}", e);
            std::process::exit(1);
        }
    });
}
