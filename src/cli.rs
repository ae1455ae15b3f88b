use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Output directory for published artifacts
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Number of fit threads (overrides config when set)
    #[arg(long)]
    pub fit_threads: Option<usize>,

    /// Treat the data source as an emulator (scan ids in headers are not checked)
    #[arg(long)]
    pub emulator: bool,

    /// Dump raw network data to the configured dump directory
    #[arg(long)]
    pub dump_network: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// First endpoint port (overrides config when set; 0 lets the OS choose)
    #[arg(long)]
    pub start_port: Option<u16>,
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}

#[cfg(test)]
mod tests {
    use super::CliOptions;
    use clap::Parser;

    #[test]
    fn defaults_leave_config_in_charge() {
        let opts = CliOptions::try_parse_from(["fitfarm"]).expect("parse");
        assert_eq!(opts.output.to_str(), Some("./output"));
        assert!(opts.fit_threads.is_none());
        assert!(opts.start_port.is_none());
        assert!(!opts.emulator);
    }

    #[test]
    fn parses_overrides() {
        let opts = CliOptions::try_parse_from([
            "fitfarm",
            "--config-path",
            "farm.yml",
            "--fit-threads",
            "6",
            "--start-port",
            "0",
            "--emulator",
            "--dump-network",
            "--log-json",
        ])
        .expect("parse");
        assert_eq!(opts.fit_threads, Some(6));
        assert_eq!(opts.start_port, Some(0));
        assert!(opts.emulator && opts.dump_network && opts.log_json);
    }

    #[test]
    fn rejects_bad_port() {
        assert!(CliOptions::try_parse_from(["fitfarm", "--start-port", "70000"]).is_err());
    }
}
