//! intvarc - Intellivision ROM archive tool

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use intv_storage::access::{self, StorageAccess};
use intv_storage::archive::nested;
use intv_storage::crc32;
use intv_storage::path;
use intv_storage::{
    ArchiveAccess, ArchiveAccessMode, ArchiveBuilder, ArchiveFormat, ArchiveImplementation,
    ArchiveOptions, Crc32Polynomial, FileCrcOptions, StorageLocation,
};
use log::{debug, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

mod cli;
use cli::{Cli, Commands, Implementation, Polynomial};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

impl From<Implementation> for ArchiveImplementation {
    fn from(value: Implementation) -> Self {
        match value {
            Implementation::Any => ArchiveImplementation::Any,
            Implementation::Native => ArchiveImplementation::Native,
            Implementation::Buffered => ArchiveImplementation::Buffered,
        }
    }
}

impl From<Polynomial> for Crc32Polynomial {
    fn from(value: Polynomial) -> Self {
        match value {
            Polynomial::Zip => Crc32Polynomial::Zip,
            Polynomial::Castagnoli => Crc32Polynomial::Castagnoli,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    access::initialize();

    match cli.command {
        Commands::List {
            archive,
            json,
            implementation,
        } => list(&archive, json, implementation.into()),

        Commands::Extract {
            archive,
            output,
            overwrite,
        } => extract(&archive, &output, overwrite),

        Commands::Crc {
            inputs,
            polynomial,
            ignore,
            duplicates,
        } => {
            let mut options = FileCrcOptions::new(polynomial.into());
            for (start, end) in ignore {
                options = options.ignore(start..=end);
            }
            checksum(&inputs, &options, duplicates)
        }

        Commands::Pack {
            output,
            inputs,
            level,
            implementation,
        } => pack(&output, &inputs, level, implementation.into()),
    }
}

/// Open the archive at `archive_path`, walking through any archives that contain it.
fn open_archive(
    archive_path: &str,
    implementation: ArchiveImplementation,
) -> Result<ArchiveAccess> {
    let located = nested::locate_from(archive_path, Some(access::initialize()))
        .with_context(|| format!("Failed to resolve {archive_path}"))?;
    if !located.location.exists() {
        bail!("Archive not found: {archive_path}");
    }
    ArchiveBuilder::new()
        .implementation(implementation)
        .open_location(&located.location)
        .with_context(|| format!("Failed to open archive {archive_path}"))
}

fn list(archive_path: &str, json: bool, implementation: ArchiveImplementation) -> Result<()> {
    let archive = open_archive(archive_path, implementation)?;
    let entries = archive.entries()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!(
        "{} ({:?}, {:?}): {} entries",
        archive_path,
        archive.format(),
        archive.implementation(),
        entries.len()
    );
    let mut total = 0u64;
    for entry in &entries {
        let marker = if entry.is_directory() { "d" } else { "-" };
        println!("  {} {:>12}  {}", marker, entry.length(), entry.name());
        total += entry.length();
    }
    println!("Total: {} bytes", total);
    Ok(())
}

/// Entry names that would land outside the output directory.
fn escapes_output(name: &str) -> bool {
    path::is_absolute(name) || name.split(path::SEPARATOR).any(|segment| segment == "..")
}

fn extract(archive_path: &str, output: &Path, overwrite: bool) -> Result<()> {
    let archive = open_archive(archive_path, ArchiveImplementation::Any)?;
    let files: Vec<_> = archive.entries()?.into_iter().filter(|e| !e.is_directory()).collect();
    fs::create_dir_all(output).with_context(|| format!("Failed to create {}", output.display()))?;

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)?
            .progress_chars("#>-"),
    );

    let mut skipped = 0usize;
    for entry in &files {
        pb.set_message(entry.name().to_string());
        if escapes_output(entry.name()) {
            warn!("skipping entry {} outside the output directory", entry.name());
            skipped += 1;
            pb.inc(1);
            continue;
        }
        let destination = output.join(entry.name());
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        archive
            .extract_entry(entry, &destination, overwrite)
            .with_context(|| format!("Failed to extract {}", entry.name()))?;
        pb.inc(1);
    }
    pb.finish_with_message("Complete");

    println!("Extracted {} files to {}", files.len() - skipped, output.display());
    if skipped > 0 {
        println!("  Skipped: {} unsafe entry names", skipped);
    }
    Ok(())
}

struct CrcJob {
    display: String,
    location: StorageLocation,
}

/// Queue every file entry of the archive at `archive_path`, descending into
/// archives stored inside it.
fn queue_archive(archive_path: &str, jobs: &mut Vec<CrcJob>) -> Result<()> {
    let archive = Arc::new(open_archive(archive_path, ArchiveImplementation::Any)?);
    let root = archive
        .root()
        .map(|r| r.path().to_string())
        .ok_or_else(|| anyhow!("Archive {archive_path} has no root location"))?;
    let provider: Arc<dyn StorageAccess> = archive.clone();

    for entry in archive.entries()?.iter().filter(|e| !e.is_directory()) {
        let entry_path = path::join(&root, entry.name());
        if path::has_archive_extension(entry.name()) {
            match queue_archive(&entry_path, jobs) {
                Ok(()) => continue,
                Err(e) => debug!("checksumming {} as a plain entry: {:#}", entry_path, e),
            }
        }
        jobs.push(CrcJob {
            location: StorageLocation::with_capability(&entry_path, Arc::clone(&provider)),
            display: entry_path,
        });
    }
    Ok(())
}

fn queue_file(file: &Path, jobs: &mut Vec<CrcJob>) -> Result<()> {
    let display = file.to_string_lossy().to_string();
    if path::has_archive_extension(&display) {
        match queue_archive(&display, jobs) {
            Ok(()) => return Ok(()),
            Err(e) => warn!(
                "{} is not a readable archive, checksumming it whole: {:#}",
                display, e
            ),
        }
    }
    jobs.push(CrcJob {
        location: StorageLocation::with_capability(&display, access::initialize()),
        display,
    });
    Ok(())
}

fn checksum(inputs: &[String], options: &FileCrcOptions, duplicates: bool) -> Result<()> {
    let mut jobs = Vec::new();
    for input in inputs {
        let input_path = Path::new(input);
        if input_path.is_dir() {
            for entry in WalkDir::new(input_path).sort_by_file_name() {
                let entry = entry.with_context(|| format!("Failed to walk {input}"))?;
                if entry.file_type().is_file() {
                    queue_file(entry.path(), &mut jobs)?;
                }
            }
        } else if input_path.is_file() {
            queue_file(input_path, &mut jobs)?;
        } else {
            // A path inside an archive.
            let located = nested::locate_from(input, Some(access::initialize()))?;
            if !located.location.exists() {
                bail!("Input not found: {input}");
            }
            if path::has_archive_extension(input) {
                queue_archive(input, &mut jobs)?;
            } else {
                jobs.push(CrcJob {
                    display: input.clone(),
                    location: located.location,
                });
            }
        }
    }

    let pb = ProgressBar::new(jobs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)?
            .progress_chars("#>-"),
    );

    let results: Vec<_> = jobs
        .par_iter()
        .map(|job| {
            let crc = crc32::of_file(&job.location, options);
            pb.inc(1);
            (job, crc)
        })
        .collect();
    pb.finish_and_clear();

    let mut failures = 0usize;
    let mut groups: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
    for (job, crc) in &results {
        match crc {
            Ok(crc) => groups.entry(*crc).or_default().push(job.display.as_str()),
            Err(e) => {
                warn!("Failed to checksum {}: {}", job.display, e);
                failures += 1;
            }
        }
    }

    if duplicates {
        let mut found = 0usize;
        for (crc, paths) in groups.iter().filter(|(_, paths)| paths.len() > 1) {
            found += 1;
            println!("{:08X}  ({} copies)", crc, paths.len());
            for path in paths {
                println!("    {}", path);
            }
        }
        println!("Duplicate groups: {}", found);
    } else {
        for (job, crc) in &results {
            if let Ok(crc) = crc {
                println!("{:08X}  {}", crc, job.display);
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {} files could not be checksummed", results.len());
    }
    Ok(())
}

/// Archive entry name for `file`, relative to the parent of the input it was found under.
fn entry_name(input: &Path, file: &Path) -> Result<String> {
    let base = match input.file_name() {
        Some(_) => input.parent().unwrap_or_else(|| Path::new("")),
        None => input,
    };
    let relative = file
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", file.display(), base.display()))?;
    Ok(path::normalize(&relative.to_string_lossy())
        .trim_start_matches(path::SEPARATOR)
        .to_string())
}

fn pack(
    output: &Path,
    inputs: &[PathBuf],
    level: u32,
    implementation: ArchiveImplementation,
) -> Result<()> {
    let output_text = output.to_string_lossy().to_string();
    let format = ArchiveFormat::from_path(&output_text)
        .ok_or_else(|| anyhow!("Cannot tell the archive format of {}", output.display()))?;
    let level = level.min(9);
    let options = ArchiveOptions {
        zip_level: (level > 0).then_some(level),
        gzip_level: level,
        ..ArchiveOptions::default()
    };

    println!("intvarc - Creating {:?} archive: {}", format, output.display());
    let archive = ArchiveBuilder::new()
        .mode(ArchiveAccessMode::Create)
        .implementation(implementation)
        .options(options)
        .open_location(&StorageLocation::with_capability(&output_text, access::initialize()))
        .with_context(|| format!("Failed to create {}", output.display()))?;

    let mut files = 0usize;
    let mut bytes = 0u64;
    for input in inputs {
        for entry in WalkDir::new(input).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to walk {}", input.display()))?;
            if entry.path() == output {
                continue;
            }
            let name = entry_name(input, entry.path())?;
            if name.is_empty() {
                continue;
            }
            if entry.file_type().is_dir() {
                if format != ArchiveFormat::GZip {
                    archive.create_entry(&format!("{name}/"))?;
                }
                continue;
            }
            let data = fs::read(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            archive
                .write_entry(&name, &data)
                .with_context(|| format!("Failed to add {name}"))?;
            debug!("packed {} ({} bytes)", name, data.len());
            files += 1;
            bytes += data.len() as u64;
        }
    }
    archive.close().with_context(|| format!("Failed to finish {}", output.display()))?;

    println!("  Files: {}", files);
    println!("  Input size: {} bytes", bytes);
    println!("  Archive size: {} bytes", fs::metadata(output)?.len());
    Ok(())
}
