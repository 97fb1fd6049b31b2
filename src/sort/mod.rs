pub mod cascade;
pub mod merge;
pub mod merge_stream;
pub mod run;
pub mod run_generation;
pub mod run_sink;
pub mod sorter;
