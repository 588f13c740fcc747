mod apply;
mod backend;
mod cli;
mod directive;
mod errors;
mod info;
mod selector;
mod validate;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use log::warn;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use cli::Cli;
use errors::BackendError;
use selector::DeviceSelection;

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let _ = TermLogger::init(
        level_from_verbosity(cli.verbose),
        log_config,
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    // Parse every token before giving up so the user sees all syntax errors
    // in one run.
    let mut directives = Vec::new();
    let mut parse_failed = false;
    for token in &cli.params {
        match directive::parse_directive(token) {
            Ok(directive) => directives.push(directive),
            Err(error) => {
                eprintln!("{error}");
                parse_failed = true;
            }
        }
    }

    let chosen = match cli.adapters.as_deref() {
        Some(text) => Some(
            DeviceSelection::parse(text)
                .map_err(|error| anyhow!("bad adapter list '{text}': {error}"))?,
        ),
        None => None,
    };

    if parse_failed {
        bail!("unable to parse parameters");
    }

    let backend = backend::detect()?;
    if backend.device_count() == 0 {
        return Err(BackendError::NoAdapters.into());
    }

    if directives.is_empty() {
        if let Some(DeviceSelection::Explicit(indices)) = &chosen {
            if indices
                .iter()
                .any(|&index| index < 0 || index as usize >= backend.device_count())
            {
                bail!("some adapter indices out of range in the --adapters list");
            }
        }
        info::print_adapters(&*backend, chosen.as_ref(), cli.verbose > 0)?;
        return Ok(());
    }

    // Parameters carry their own adapter selectors; the --adapters list only
    // filters the report.
    if chosen.is_some() {
        warn!("--adapters is ignored when parameters are given");
    }

    // One capability snapshot per invocation; validation and apply both
    // work against it.
    let caps = (0..backend.device_count())
        .map(|device| backend.capabilities(device))
        .collect::<Result<Vec<_>, _>>()?;

    if let Err(violations) = validate::validate(&directives, &caps) {
        for violation in &violations {
            eprintln!("{violation}");
        }
        bail!("no settings applied, errors in parameters");
    }

    apply::apply(&*backend, &directives, &caps)?;
    Ok(())
}
