// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

//======================================================================================================================
// Modules
//======================================================================================================================

mod args;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::args::ProgramArguments;
use ::anyhow::Result;
use ::std::{
    thread,
    time::{
        Duration,
        Instant,
    },
};
use ::taskkit::{
    Config,
    OneOf2,
    SchedulerActivation,
    SchedulerId,
    Task,
    TaskSystem,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const TIMER_DURATION: Duration = Duration::from_millis(50);

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Debug)]
struct Report {
    joined: (&'static str, &'static str),
    sum_of_squares: u64,
    race_winner: &'static str,
    elapsed: Duration,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Work driven by the frame loop: a delay, a join, an offload and a race.
async fn run_demo(system: TaskSystem, items: usize) -> Report {
    let started: Instant = Instant::now();

    system.delay_frames(2).await;

    let short: Task<&'static str> = system.spawn({
        let delay = system.delay_frames(1);
        async move {
            delay.await;
            "short"
        }
    });
    let long: Task<&'static str> = system.spawn({
        let delay = system.delay_frames(5);
        async move {
            delay.await;
            "long"
        }
    });
    let joined: (&'static str, &'static str) = system.when_all((short, long)).await;

    let sum_of_squares = move || -> u64 { (1..=items as u64).map(|i| i * i).sum() };
    let sum_of_squares: u64 = match system.thread_pool() {
        Some(_) => system.run_on_thread_pool(sum_of_squares).await,
        None => sum_of_squares(),
    };

    let timer: Task<&'static str> = system.spawn({
        let wait = system.wait_for(TIMER_DURATION);
        async move {
            wait.await;
            "timer"
        }
    });
    let frames: Task<&'static str> = system.spawn({
        let delay = system.delay_frames(3);
        async move {
            delay.await;
            "frames"
        }
    });
    let race_winner: &'static str = match system.when_any((timer, frames)).await {
        OneOf2::First(winner) | OneOf2::Second(winner) => winner,
    };

    Report {
        joined,
        sum_of_squares,
        race_winner,
        elapsed: started.elapsed(),
    }
}

//======================================================================================================================
// main
//======================================================================================================================

fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new(
        "quickstart",
        "Microsoft Corporation",
        "Drives cooperative tasks from a frame loop, with a thread pool for heavy work.",
    )?;

    let mut config: Config = match args.config_path() {
        Some(path) => Config::new(path)?,
        None => Config::default(),
    };
    if let Some(workers) = args.workers() {
        config.thread_pool_size = workers;
    }

    let system: TaskSystem = TaskSystem::initialize(config)?;
    let scheduler_id: SchedulerId = system.main_thread_scheduler_ids()[0];

    let (report, frames): (Report, usize) = {
        let _activation: SchedulerActivation = system.activate_scheduler(scheduler_id);
        let mut task: Task<Report> = system.spawn(run_demo(system.clone(), args.items()));
        let mut frames: usize = 0;
        loop {
            task = match task.try_get() {
                Ok(report) => break (report, frames),
                Err(task) => task,
            };
            thread::sleep(args.frame_time());
            system.update_activated_scheduler();
            frames += 1;
        }
    };

    println!("joined: {:?}", report.joined);
    println!("sum of squares: {}", report.sum_of_squares);
    println!("race winner: {}", report.race_winner);
    println!("frames: {}, elapsed: {:?}", frames, report.elapsed);

    system.shutdown();
    Ok(())
}
