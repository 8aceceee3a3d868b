// Copyright (C) 2020  Nexminer contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! BTC08 mining daemon.
//!
//! Without a mining frontend linked in, the daemon feeds the chains from a
//! built-in benchmark work source; with `--test-mode` it runs the
//! production hash board self-test instead and exits.

use nexminer::logging::macros::*;
use nexminer::{hal::Backend as _, shutdown, stats, work};

use nexminer_btc08::{config, gpio, null_work, Backend};

use futures::lock::Mutex;

use std::path::Path;
use std::process;
use std::sync::Arc;

fn parse_args() -> (config::Backend, config::CliOptions) {
    let app = clap::App::new("nexminer-btc08")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            clap::Arg::with_name("config")
                .long("config")
                .help("Set config file path")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("options")
                .long("options")
                .value_name("SPI_KHZ:PLL_MHZ:UDIV")
                .help("Bus/clock triplet, 0 keeps a default")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("min-cores")
                .long("min-cores")
                .help("Minimum live cores per chip")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("min-chips")
                .long("min-chips")
                .help("Minimum chips per chain")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("test-mode")
                .long("test-mode")
                .help("Run the hash board self-test and exit")
                .required(false),
        )
        .arg(
            clap::Arg::with_name("chips")
                .long("chips")
                .value_name("NUM_CHIPS:NUM_CORES")
                .help("Expected chip count and enabled cores per chip, 0 keeps a default")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("dump-traffic")
                .long("dump-traffic")
                .help("Hexdump all SPI traffic to the log")
                .required(false),
        )
        .arg(
            clap::Arg::with_name("disable-asic-boost")
                .long("disable-asic-boost")
                .help("Disable ASIC boost (use just one midstate)")
                .required(false),
        );
    let matches = app.get_matches();

    let config_path = matches
        .value_of("config")
        .unwrap_or(config::DEFAULT_CONFIG_PATH);
    let mut backend_config = if Path::new(config_path).exists() {
        match config::Backend::parse(config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("Cannot load configuration file \"{}\"", config_path);
                error!("Reason: {}", e);
                process::exit(1);
            }
        }
    } else {
        config::Backend::default()
    };

    if matches.is_present("disable-asic-boost") {
        backend_config.asic_boost = Some(false);
    }

    let mut cli = config::CliOptions::default();
    let cli_result = (|| -> nexminer_btc08::error::Result<()> {
        if let Some(triplet) = matches.value_of("options") {
            cli.parse_options_triplet(triplet)?;
        }
        if let Some(spec) = matches.value_of("chips") {
            cli.parse_chips(spec)?;
        }
        Ok(())
    })();
    if let Err(e) = cli_result {
        error!("Bad command line: {}", e);
        process::exit(1);
    }

    if let Some(value) = matches.value_of("min-cores") {
        cli.min_cores = Some(value.parse().expect("not a number"));
    }
    if let Some(value) = matches.value_of("min-chips") {
        cli.min_chips = Some(value.parse().expect("not a number"));
    }
    cli.test_mode = matches.is_present("test-mode");
    cli.dump_traffic = matches.is_present("dump-traffic");

    (backend_config, cli)
}

/// Run the production self-test on every detected chain
async fn run_selftest(backend_config: &config::Backend, settings: config::ResolvedChainConfig) -> bool {
    let selftest_config = backend_config.resolve_selftest_config();
    let pin_mgr = gpio::ControlPinManager::new();
    // solutions are not forwarded anywhere in test mode
    let (_job_tx, _generator, solution_tx, _solution_rx) = work::solver_pair(work::AcceptAll);

    let mut all_ok = true;
    let mut found = 0;
    for port in 0..gpio::MAX_SPI_PORT {
        let mut chain =
            match nexminer_btc08::setup_chain(&pin_mgr, port, &settings, solution_tx.clone()).await
            {
                Ok(chain) => chain,
                Err(e) => {
                    warn!("No BTC08 chain on port {}: {}", port, e);
                    continue;
                }
            };
        found += 1;
        match chain.hashboard_selftest(&selftest_config).await {
            Ok(()) => info!("chain {}: TEST OK", port),
            Err(e) => {
                error!("chain {}: TEST FAIL: {}", port, e);
                all_ok = false;
            }
        }
    }
    all_ok && found > 0
}

/// Feed the chains from the built-in benchmark source and log solutions
async fn run_benchmark(settings: config::ResolvedChainConfig) {
    let (job_tx, generator, solution_tx, mut solution_rx) = work::solver_pair(work::AcceptAll);
    let (shutdown_tx, mut shutdown_rx) = shutdown::channel();
    let mining_stats = Arc::new(Mutex::new(stats::Mining::default()));

    let midstate_count = settings.midstate_count;
    Backend::new(settings).run(generator, solution_tx, mining_stats.clone(), shutdown_tx);

    // benchmark work producer
    tokio::spawn(async move {
        let mut i: u64 = 0;
        loop {
            let work = null_work::prepare_benchmark(i, midstate_count, 1.0);
            if job_tx.send(work).await.is_err() {
                break;
            }
            i += 1;
        }
    });

    // solution logger
    let solution_stats = mining_stats.clone();
    tokio::spawn(async move {
        while let Some(solution) = solution_rx.receive().await {
            info!(
                "solution: nonce {:#010x}, midstate {}",
                solution.nonce(),
                solution.midstate_idx()
            );
            solution_stats.lock().await.unique_solutions += 1;
        }
    });

    let reason = shutdown_rx
        .receive()
        .await
        .unwrap_or_else(|| "shutdown channel closed".to_string());
    let stats = mining_stats.lock().await;
    info!(
        "shutting down: {} (ranges {}, solutions {})",
        reason, stats.nonce_ranges_done, stats.unique_solutions
    );
}

#[tokio::main]
async fn main() {
    nexminer::logging::setup_for_app();

    let (backend_config, cli) = parse_args();
    let settings = backend_config.resolve_chain_config(&cli);

    if settings.test_mode {
        let ok = run_selftest(&backend_config, settings.clone()).await;
        process::exit(if ok { 0 } else { 1 });
    }

    run_benchmark(settings).await;
}
