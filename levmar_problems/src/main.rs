mod problems;

use std::path::Path;

use anyhow::Result;
use common::log_setup::setup_logging;
use levmar::{Levmar, SolverConfig};
use tracing::info;

use crate::problems::{harness_config, osborne, wood};

fn main() -> Result<()> {
    setup_logging("info", common::is_debug().then_some(Path::new("logs")));

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "loading solver config");
            SolverConfig::load(&path)?
        }
        None => harness_config(),
    };

    let levmar = Levmar::with_config(&config);
    print!("{}", wood(&levmar, &config)?);
    println!();
    print!("{}", osborne(&levmar, &config)?);

    Ok(())
}
