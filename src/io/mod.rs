// ABOUTME: I/O engine: file/dir/SFTP formats and the pipeline operators built on them

pub mod formats;
pub mod operators;
pub mod sftp;
