pub mod archive;
pub mod aspect;
pub mod band;
pub mod calibration;
pub mod chunking;
pub mod config;
pub mod constants;
pub mod merge;
pub mod photon_stream;
pub mod photonpipe_errors;
pub mod pipeline;
pub mod pool;
pub mod progress_bar;
pub mod scst;
pub mod shared_memory;
pub mod stim;
pub mod telemetry;
pub mod worker;
pub mod writer;
