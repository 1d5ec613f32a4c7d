//! File-backed images survive closing and reopening

use flashlog_rs::{FlashError, FlashFs, FlashFsBuilder, Geometry, MmapFlash};
use tempfile::TempDir;

fn geometry() -> Geometry {
    Geometry::new(128 * 1024, 8192, 512)
}

#[test]
fn test_image_round_trips_through_the_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("flash.img");
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8).collect();

    {
        let flash = MmapFlash::create(&path, geometry()).unwrap();
        let fs = FlashFs::new(flash).unwrap();
        fs.format().unwrap();
        fs.write_all_bytes("firmware.bin", &payload).unwrap();
        fs.write_all_bytes("settings", b"volume=7").unwrap();
        fs.delete("settings").unwrap();
        fs.write_all_bytes("settings", b"volume=9").unwrap();
        fs.with_engine(|engine| engine.device().sync()).unwrap();
    }

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 128 * 1024);

    let flash = MmapFlash::open(&path, geometry()).unwrap();
    let fs = FlashFs::new(flash).unwrap();
    fs.mount().unwrap();
    assert_eq!(fs.get_files().unwrap(), vec!["FIRMWARE.BIN", "SETTINGS"]);
    assert_eq!(fs.read_all_bytes("firmware.bin").unwrap(), payload);
    assert_eq!(fs.read_all_bytes("settings").unwrap(), b"volume=9");
    assert!(fs.get_stats().unwrap().orphaned_clusters > 0);
}

#[test]
fn test_fresh_image_file_needs_format_or_mounts_empty() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("blank.img");

    // A freshly created image is fully erased, which mounts as empty
    let flash = MmapFlash::create(&path, geometry()).unwrap();
    let fs = FlashFs::new(flash).unwrap();
    fs.mount().unwrap();
    assert!(fs.get_files().unwrap().is_empty());
    drop(fs);

    // Garbage is refused unless the builder may format
    std::fs::write(&path, vec![0x42u8; 128 * 1024]).unwrap();
    let flash = MmapFlash::open(&path, geometry()).unwrap();
    let fs = FlashFs::new(flash).unwrap();
    assert!(matches!(fs.mount(), Err(FlashError::NotFormatted(_))));
    drop(fs);

    let flash = MmapFlash::open(&path, geometry()).unwrap();
    let fs = FlashFsBuilder::new(flash)
        .format_if_unformatted(true)
        .mount()
        .unwrap();
    assert_eq!(
        fs.get_stats().unwrap().free_clusters,
        geometry().total_clusters()
    );
}

#[test]
fn test_open_rejects_mismatched_geometry() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("small.img");
    MmapFlash::create(&path, Geometry::new(64 * 1024, 8192, 512)).unwrap();

    assert!(matches!(
        MmapFlash::open(&path, geometry()),
        Err(FlashError::InvalidGeometry(_))
    ));
    assert!(matches!(
        MmapFlash::open(temp_dir.path().join("missing.img"), geometry()),
        Err(FlashError::Io(_))
    ));
}
