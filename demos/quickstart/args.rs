// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use anyhow::Result;
use clap::{
    Arg,
    ArgMatches,
    Command,
};
use std::time::Duration;

#[derive(Debug)]
pub struct ProgramArguments {
    /// Path to a YAML configuration file.
    config_path: Option<String>,
    /// Number of thread pool workers, overriding the configuration.
    workers: Option<usize>,
    /// Length of a frame.
    frame_time: Duration,
    /// Number of items processed on the thread pool.
    items: usize,
}

impl ProgramArguments {
    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets configuration file"),
            )
            .arg(
                Arg::new("workers")
                    .long("workers")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("NUMBER")
                    .help("Sets number of thread pool workers"),
            )
            .arg(
                Arg::new("frame-ms")
                    .long("frame-ms")
                    .value_parser(clap::value_parser!(u64))
                    .required(false)
                    .value_name("MILLISECONDS")
                    .help("Sets frame length"),
            )
            .arg(
                Arg::new("items")
                    .long("items")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("NUMBER")
                    .help("Sets number of items processed on the thread pool"),
            )
            .get_matches();

        let mut args: ProgramArguments = Self {
            config_path: matches.get_one::<String>("config").cloned(),
            workers: None,
            frame_time: Duration::from_millis(16),
            items: 1_000,
        };

        if let Some(workers) = matches.get_one::<usize>("workers") {
            if *workers == 0 {
                anyhow::bail!("invalid number of workers");
            }
            args.workers = Some(*workers);
        }

        if let Some(frame_ms) = matches.get_one::<u64>("frame-ms") {
            args.frame_time = Duration::from_millis(*frame_ms);
        }

        if let Some(items) = matches.get_one::<usize>("items") {
            if *items == 0 {
                anyhow::bail!("invalid number of items");
            }
            args.items = *items;
        }

        Ok(args)
    }

    pub fn config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }

    pub fn workers(&self) -> Option<usize> {
        self.workers
    }

    pub fn frame_time(&self) -> Duration {
        self.frame_time
    }

    pub fn items(&self) -> usize {
        self.items
    }
}
