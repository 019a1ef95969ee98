//! CLI entry point. Grounded on `original_source/main/main.cc`'s
//! argument-validation-then-run shape.

use thttpd::{Config, Server};

fn main() {
    let config = match Config::from_args(std::env::args()) {
        Ok(config) => config,
        Err(e) => {
            proxy_log::error!("{}", e);
            std::process::exit(1);
        }
    };

    proxy_log::set_verbosity(config.verbosity);

    let mut server = match Server::new(
        config.port,
        config.path_to_serve,
        config.num_worker_threads,
        config.cache_bytes,
    ) {
        Ok(server) => server,
        Err(e) => {
            proxy_log::error!("failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        proxy_log::error!("server exited: {}", e);
        std::process::exit(1);
    }
}
