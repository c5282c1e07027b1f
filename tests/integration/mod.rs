//! Integration tests for darkroom

mod cli;
mod comparer;
mod config;
mod orchestrator;
mod pipeline;
mod test_utils;
mod work_queue;
