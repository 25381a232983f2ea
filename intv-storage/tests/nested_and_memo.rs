use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use intv_storage::access::{self, ReadOnlyStream, StorageAccess};
use intv_storage::archive::nested;
use intv_storage::crc32::{self, FileCrcCache};
use intv_storage::{
    ArchiveAccess, ArchiveAccessMode, ArchiveFormat, Crc32Polynomial, EntryMemo, ErrorCategory,
    FileCrcOptions, StorageConfig, StorageLocation,
};

const ROM: &[u8] = b"\x00\x01\x02\x03intellivision";

/// `set.zip` holding `games.zip`, which holds `sub/rom.bin`.
fn nested_fixture(dir: &Path) -> Result<String> {
    let inner = dir.join("games.zip");
    {
        let archive = ArchiveAccess::open_path(&inner, ArchiveAccessMode::Create)?;
        archive.write_entry("sub/rom.bin", ROM)?;
    }
    let inner_bytes = fs::read(&inner)?;
    fs::remove_file(&inner)?;

    let outer = dir.join("set.zip");
    {
        let archive = ArchiveAccess::open_path(&outer, ArchiveAccessMode::Create)?;
        archive.write_entry("games.zip", &inner_bytes)?;
    }
    Ok(format!("{}/games.zip/sub/rom.bin", outer.to_string_lossy()))
}

fn memo_in(dir: &Path) -> EntryMemo {
    EntryMemo::new(&StorageConfig {
        extraction_root: dir.to_path_buf(),
        ..StorageConfig::default()
    })
}

#[test]
fn test_locate_through_nested_archives() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let target = nested_fixture(dir.path())?;

    let located = nested::locate_from(&target, Some(access::initialize()))?;
    assert_eq!(located.archives.len(), 2, "both archive segments are opened");
    assert!(located.location.exists());
    assert_eq!(located.location.size()?, ROM.len() as u64);

    let innermost = located.innermost().expect("innermost archive");
    let entry = innermost.find_entry("SUB/ROM.BIN")?.expect("entry in inner archive");
    assert_eq!(innermost.read_entry(&entry)?, ROM);

    let archive = nested::locate_archive(&target)?.expect("containing archive");
    println!("innermost archive: {:?}", archive);
    assert_eq!(archive.entries()?.len(), 1);
    Ok(())
}

#[test]
fn test_entry_memo_extracts_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let target = nested_fixture(dir.path())?;
    let memo = memo_in(cache.path());

    let located = nested::locate_from(&target, Some(access::initialize()))?;
    let first = memo.path_for(&located.location)?;
    assert!(first.starts_with(cache.path()));
    assert_eq!(fs::read(&first)?, ROM);
    let stamp = fs::metadata(&first)?.modified()?;

    let second = memo.path_for(&located.location)?;
    assert_eq!(first, second);
    assert_eq!(fs::metadata(&second)?.modified()?, stamp, "second lookup must not extract again");
    assert_eq!(memo.len(), 1);

    // A location on the local provider maps to the same extraction.
    let local = StorageLocation::with_capability(&target, access::initialize());
    assert_eq!(memo.path_for(&local)?, first);
    Ok(())
}

#[test]
fn test_entry_memo_reextracts_deleted_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let target = nested_fixture(dir.path())?;
    let memo = memo_in(cache.path());

    let located = nested::locate_from(&target, Some(access::initialize()))?;
    let first = memo.path_for(&located.location)?;
    fs::remove_file(&first)?;

    let again = memo.path_for(&located.location)?;
    assert_eq!(first, again);
    assert_eq!(fs::read(&again)?, ROM);

    let local = StorageLocation::with_capability(&target, access::initialize());
    fs::remove_file(&again)?;
    let mut data = Vec::new();
    std::io::Read::read_to_end(&mut memo.open(&local)?, &mut data)?;
    assert_eq!(data, ROM);
    Ok(())
}

#[test]
fn test_entry_memo_passes_plain_files_through() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let file = dir.path().join("rom.bin");
    fs::write(&file, ROM)?;
    let memo = memo_in(cache.path());

    let location = StorageLocation::with_capability(file.to_string_lossy(), access::initialize());
    assert_eq!(memo.path_for(&location)?, Path::new(location.path()));
    assert!(memo.is_empty());
    assert_eq!(fs::read_dir(cache.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_entry_memo_resolves_relative_archive_paths() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = tempfile::tempdir()?;
    let zip = dir.path().join("games.zip");
    {
        let archive = ArchiveAccess::open_path(&zip, ArchiveAccessMode::Create)?;
        archive.write_entry("sub/rom.bin", ROM)?;
    }
    let memo = memo_in(cache.path());

    let archive: Arc<dyn StorageAccess> =
        Arc::new(ArchiveAccess::open_path(&zip, ArchiveAccessMode::Read)?);
    let relative = StorageLocation::with_capability("sub/rom.bin", Arc::clone(&archive));
    let extracted = memo.path_for(&relative)?;
    assert!(extracted.starts_with(cache.path()));
    assert_eq!(fs::read(&extracted)?, ROM);

    let absolute = format!("{}/sub/rom.bin", zip.to_string_lossy());
    let absolute = StorageLocation::with_capability(&absolute, archive);
    assert_eq!(memo.path_for(&absolute)?, extracted);

    // Without a root there is nothing to anchor a relative name to.
    let stream = Box::new(ReadOnlyStream::from_bytes(fs::read(&zip)?));
    let rootless: Arc<dyn StorageAccess> =
        Arc::new(ArchiveAccess::open(stream, ArchiveFormat::Zip, ArchiveAccessMode::Read)?);
    let orphan = StorageLocation::with_capability("sub/rom.bin", rootless);
    let err = memo.path_for(&orphan).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidOperation);
    assert_eq!(fs::read_dir(cache.path())?.count(), 1, "only the rooted archive was extracted");
    Ok(())
}

#[test]
fn test_crc_of_file_inside_archive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let target = nested_fixture(dir.path())?;
    let located = nested::locate_from(&target, Some(access::initialize()))?;

    let cache = FileCrcCache::new();
    let zip = FileCrcOptions::new(Crc32Polynomial::Zip);
    let crc = cache.of_file(&located.location, &zip)?;
    assert_eq!(crc, crc32::of_buffer(ROM, Crc32Polynomial::Zip));

    // Header byte excluded.
    let masked = FileCrcOptions::new(Crc32Polynomial::Zip).ignore(0..=0);
    let mut altered = ROM.to_vec();
    altered[0] = 0xAA;
    assert_eq!(
        cache.of_file(&located.location, &masked)?,
        crc32::of_block(&altered, &[0..=0], Crc32Polynomial::Zip)
    );
    assert_eq!(crc32::of_block(b"\xAA123456789", &[0..=0], Crc32Polynomial::Zip), 0xCBF4_3926);

    let fs_provider: Arc<dyn StorageAccess> = access::initialize();
    assert!(!fs_provider.exists(&target), "the local provider cannot see into archives");
    Ok(())
}
