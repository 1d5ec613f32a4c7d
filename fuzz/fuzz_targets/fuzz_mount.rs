#![no_main]
use flashlog_rs::{FlashFs, Geometry, RamFlash};
use libfuzzer_sys::fuzz_target;

// 4 sectors x 4 clusters of 64 bytes
const DEVICE_SIZE: usize = 1024;

// Mounting arbitrary bytes either fails cleanly or yields a usable file system
fuzz_target!(|input: &[u8]| {
    let mut image = vec![0xFFu8; DEVICE_SIZE];
    let len = input.len().min(DEVICE_SIZE);
    image[..len].copy_from_slice(&input[..len]);

    let flash = match RamFlash::from_image(Geometry::new(DEVICE_SIZE as u64, 256, 64), image) {
        Ok(flash) => flash,
        Err(_) => return,
    };
    let fs = match FlashFs::builder(flash).reserved_sectors(1).build() {
        Ok(fs) => fs,
        Err(_) => return,
    };
    if fs.mount().is_err() {
        return;
    }

    let names = fs.get_files().unwrap();
    // Names come straight from the image and need not survive folding
    for name in &names {
        if let (Ok(data), Ok(size)) = (fs.read_all_bytes(name), fs.get_file_size(name)) {
            assert_eq!(data.len() as u64, size);
        }
    }

    // Whatever mount repaired must compact and remount to the same files
    let _ = fs.compact();
    fs.mount().unwrap();
    assert_eq!(fs.get_files().unwrap(), names);
});
