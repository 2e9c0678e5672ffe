//  Copyright 2024 Cedana.
//
//  Modifications licensed under the Apache License, Version 2.0.

//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Executable entry point: loads `Config`, opens the stream catalog and the
//! stream-request pipeline, then runs the single-threaded control loop that
//! drives them — the event loop is cooperative; the job manager's worker
//! pool is where the blocking work happens.
//!
//! Accepting connections and decoding wire packets into `push_request`/
//! `write_data` calls is out of scope — this binary proves out the core's
//! bootstrap and shutdown sequence, not a network front end.

#![cfg_attr(debug_assertions, allow(dead_code, unused_imports, unused_variables))]

#[macro_use]
extern crate anyhow;

use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};
use structopt::{StructOpt, clap::AppSettings};
use anyhow::{Context, Result};

use streamkeep::{
    config::Config,
    job_manager::JobManager,
    stream_manager::StreamManager,
    stream_request::{JobPayload, StreamRequestPipeline},
    util::now_millis,
};

#[derive(StructOpt, Debug)]
#[structopt(about,
    global_setting(AppSettings::DeriveDisplayOrder),
    global_setting(AppSettings::DisableHelpSubcommand),
    global_setting(AppSettings::VersionlessSubcommands),
)]
struct Opts {
    /// Path to the JSON configuration file.
    #[structopt(short = "c", long)]
    config: PathBuf,

    /// Number of control-loop ticks to run before exiting. Absent means run forever (until
    /// killed); used by integration tests to bound the process lifetime.
    #[structopt(long)]
    ticks: Option<u64>,
}

fn run(opts: Opts) -> Result<()> {
    let config = Config::load(&opts.config).with_context(|| format!("loading config from {}", opts.config.display()))?;

    let mut stream_manager = StreamManager::open(&config.basepath)
        .with_context(|| format!("opening stream manager at {}", config.basepath.display()))?;

    let job_manager = Arc::new(JobManager::<JobPayload>::new(config.job_workers, config.job_pending_capacity));
    let mut pipeline = StreamRequestPipeline::new(Arc::clone(&job_manager), config.mapping_path.clone())
        .context("starting stream-request pipeline")?;

    tracing::info!(
        basepath = %config.basepath.display(),
        mapping_path = %config.mapping_path.display(),
        job_workers = config.job_workers,
        "streamkeepd: started"
    );

    let mut tick: u64 = 0;
    loop {
        pipeline.update(now_millis(), &mut stream_manager);
        while let Some((user_id, result)) = pipeline.pop_done() {
            match result {
                Ok(_) => tracing::debug!(%user_id, "streamkeepd: stream created"),
                Err(e) => tracing::warn!(%user_id, error = %e, "streamkeepd: stream creation failed"),
            }
        }

        tick += 1;
        if let Some(limit) = opts.ticks {
            if tick >= limit {
                break;
            }
        }
        thread::sleep(Duration::from_millis(100));
    }

    job_manager.stop(true);
    stream_manager.flush()?;
    stream_manager.destroy();
    tracing::info!("streamkeepd: shut down cleanly");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    run(Opts::from_args())
}
