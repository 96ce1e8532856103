mod codec;
mod config;
mod engine;
mod io;
mod pipeline;
mod scheduler;
mod state;

use crate::{
    config::{BackendKind, config},
    engine::ChordEngine,
    io::{EventStream, OutputSink},
    pipeline::Pipeline,
    scheduler::{cooperative::DeadlineQueue, poll::PollLoop, threads::ThreadTimers},
};
use anyhow::Result;
use log::info;
use std::fs::File;
use std::os::fd::AsFd;

fn main() -> Result<()> {
    env_logger::init();
    let (config, config_path) = config()?;
    let rule = config.rule()?;

    info!(
        "{:?} within {}ms -> {:?} ({:?} backend, config {})",
        rule.sources,
        rule.threshold.as_millis(),
        rule.target,
        config.backend,
        config_path.display()
    );

    // Unbuffered: a user-space buffer would hide input from poll(2).
    let input = File::from(std::io::stdin().as_fd().try_clone_to_owned()?);
    let stream = EventStream::new(input);
    let sink = OutputSink::new(std::io::stdout().lock(), config.holdoff());

    match config.backend {
        BackendKind::Threads => {
            Pipeline::new(ChordEngine::new(&rule, ThreadTimers::spawn(stream)), sink).run()
        }
        BackendKind::Cooperative => {
            Pipeline::new(ChordEngine::new(&rule, DeadlineQueue::new(stream)?), sink).run()
        }
        BackendKind::Poll => {
            Pipeline::new(ChordEngine::new(&rule, PollLoop::new(stream)), sink).run()
        }
    }
}
