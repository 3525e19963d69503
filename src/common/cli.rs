//! CLI argument parsing for the readout binaries
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance

use clap::Parser;

/// Common arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "readout.toml")]
    pub config_file: String,
}

/// Arguments for the readout host
#[derive(Parser, Debug, Clone)]
#[command(name = "readout_host", about = "Digitizer readout host producing strax chunks")]
pub struct HostArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Override hostname used for board selection and worker count
    #[arg(long)]
    pub hostname: Option<String>,

    /// Override output directory for chunk files
    #[arg(short = 'o', long = "output")]
    pub output_dir: Option<String>,

    /// Length of the run in seconds
    #[arg(long, default_value = "10")]
    pub run_seconds: u64,
}

/// Arguments for the fragment dump tool
#[derive(Parser, Debug, Clone)]
#[command(name = "fragment_dump", about = "Print fragment headers from a chunk file")]
pub struct DumpArgs {
    /// Chunk file to inspect
    pub file: String,

    /// Fragment payload size in bytes (must match the producing run)
    #[arg(long, default_value = "220")]
    pub payload_bytes: usize,

    /// Print at most this many fragments (0 = all)
    #[arg(short = 'n', long, default_value = "0")]
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_args_default() {
        let args = CommonArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.config_file, "readout.toml");
    }

    #[test]
    fn test_common_args_custom_config() {
        let args = CommonArgs::try_parse_from(["test", "-f", "custom.toml"]).unwrap();
        assert_eq!(args.config_file, "custom.toml");
    }

    #[test]
    fn test_host_args_default() {
        let args = HostArgs::try_parse_from(["test"]).unwrap();
        assert_eq!(args.common.config_file, "readout.toml");
        assert_eq!(args.hostname, None);
        assert_eq!(args.run_seconds, 10);
    }

    #[test]
    fn test_host_args_full() {
        let args = HostArgs::try_parse_from([
            "test",
            "--config",
            "daq.toml",
            "--hostname",
            "reader0",
            "-o",
            "/data/strax",
            "--run-seconds",
            "30",
        ])
        .unwrap();
        assert_eq!(args.common.config_file, "daq.toml");
        assert_eq!(args.hostname, Some("reader0".to_string()));
        assert_eq!(args.output_dir, Some("/data/strax".to_string()));
        assert_eq!(args.run_seconds, 30);
    }

    #[test]
    fn test_dump_args() {
        let args =
            DumpArgs::try_parse_from(["test", "000042_post", "-n", "5"]).unwrap();
        assert_eq!(args.file, "000042_post");
        assert_eq!(args.payload_bytes, 220);
        assert_eq!(args.limit, 5);
    }
}
