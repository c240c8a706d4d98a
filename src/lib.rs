pub mod config;
pub mod controller;
pub mod descriptor;
pub mod error;
pub mod mode_guard;
pub mod normalize;
pub mod output;
pub mod parser;
pub mod probe;
pub mod probe_engine;
pub mod probe_result;
pub mod ranker;
pub mod reporter;
pub mod subscription;
