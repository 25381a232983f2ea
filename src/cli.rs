//! Command-line interface for intvarc

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "intvarc")]
#[command(
    about = "intvarc - Inspect, checksum and pack Intellivision ROM archives",
    long_about = None
)]
pub struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Polynomial {
    Zip,
    Castagnoli,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Implementation {
    Any,
    Native,
    Buffered,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List archive contents; the archive may itself sit inside another archive
    List {
        /// Archive path, e.g. roms/set.tar/games.zip
        archive: String,

        /// Print entries as JSON
        #[arg(long)]
        json: bool,

        /// Backend to open the archive with
        #[arg(long, value_enum, default_value = "any")]
        implementation: Implementation,
    },

    /// Extract every file entry of an archive
    Extract {
        /// Archive path
        archive: String,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Replace files that already exist
        #[arg(long)]
        overwrite: bool,
    },

    /// Checksum ROM files, descending into directories and archives
    Crc {
        /// Files, directories or archive paths
        #[arg(required = true)]
        inputs: Vec<String>,

        /// CRC polynomial
        #[arg(long, value_enum, default_value = "zip")]
        polynomial: Polynomial,

        /// Byte ranges to leave out, as START-END (inclusive)
        #[arg(long = "ignore", value_parser = parse_range)]
        ignore: Vec<(u64, u64)>,

        /// Only report files whose checksums collide
        #[arg(long)]
        duplicates: bool,
    },

    /// Pack files or directories into a new zip, gzip or tar archive
    Pack {
        /// Output archive; the format follows the extension
        #[arg(short, long)]
        output: PathBuf,

        /// Input files or directories
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Deflate level (0-9, 0 stores zip entries uncompressed)
        #[arg(long, default_value = "6")]
        level: u32,

        /// Backend to write with
        #[arg(long, value_enum, default_value = "any")]
        implementation: Implementation,
    },
}

fn parse_range(text: &str) -> Result<(u64, u64), String> {
    let (start, end) = text
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got '{text}'"))?;
    let parse = |s: &str| {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        }
        .map_err(|e| format!("bad offset '{s}': {e}"))
    };
    let (start, end) = (parse(start)?, parse(end)?);
    if start > end {
        return Err(format!("range {start}-{end} is reversed"));
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_accept_decimal_and_hex() {
        assert_eq!(parse_range("0-0"), Ok((0, 0)));
        assert_eq!(parse_range("0x10-0x1f"), Ok((16, 31)));
        assert!(parse_range("5-1").is_err());
        assert!(parse_range("12").is_err());
    }

    #[test]
    fn cli_parses_crc_options() {
        let args = ["intvarc", "-v", "crc", "roms", "--ignore", "0-3", "--duplicates"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Crc { inputs, ignore, duplicates, .. } => {
                assert_eq!(inputs, vec!["roms"]);
                assert_eq!(ignore, vec![(0, 3)]);
                assert!(duplicates);
            }
            _ => panic!("expected crc"),
        }
    }
}
