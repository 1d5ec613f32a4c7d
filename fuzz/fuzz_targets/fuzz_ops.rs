#![no_main]
use flashlog_rs::{FlashError, FlashFs, Geometry, OpenMode, RamFlash};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};
use std::collections::BTreeMap;

#[derive(Debug, Arbitrary)]
enum FileOp {
    Write { name: u8, data: Vec<u8> },
    Append { name: u8, data: Vec<u8> },
    Truncate { name: u8, len: u16 },
    Delete { name: u8 },
    Rename { from: u8, to: u8 },
    Compact,
    Remount,
}

fn name_of(index: u8) -> String {
    format!("F{}", index % 6)
}

// Random operation sequences must keep files equal to a plain model
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<FileOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let flash = RamFlash::new(Geometry::new(16 * 1024, 1024, 128)).unwrap();
    let fs = FlashFs::new(flash).unwrap();
    fs.format().unwrap();
    let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for op in ops.into_iter().take(64) {
        match op {
            FileOp::Write { name, data } => {
                let name = name_of(name);
                match fs.write_all_bytes(&name, &data) {
                    Ok(()) => {
                        model.insert(name, data);
                    }
                    // A failed rewrite leaves an unknown prefix behind
                    Err(FlashError::DiskFull) | Err(FlashError::FileTooLarge) => {
                        let _ = fs.delete(&name);
                        model.remove(&name);
                    }
                    Err(e) => panic!("write failed: {}", e),
                }
            }
            FileOp::Append { name, data } => {
                let name = name_of(name);
                let mut file = match fs.open(&name, OpenMode::Append) {
                    Ok(file) => file,
                    Err(FlashError::DiskFull) => continue,
                    Err(e) => panic!("open failed: {}", e),
                };
                let written = file.write_bytes(&data);
                drop(file);
                match written {
                    Ok(_) => model.entry(name).or_default().extend_from_slice(&data),
                    Err(FlashError::DiskFull) => {
                        fs.delete(&name).unwrap();
                        model.remove(&name);
                    }
                    Err(e) => panic!("append failed: {}", e),
                }
            }
            FileOp::Truncate { name, len } => {
                let name = name_of(name);
                if let Some(contents) = model.get_mut(&name) {
                    let len = len as usize % (contents.len() + 1);
                    let mut file = fs.open(&name, OpenMode::Open).unwrap();
                    match file.set_len(len as u64) {
                        Ok(()) => contents.truncate(len),
                        Err(FlashError::DiskFull) => {
                            drop(file);
                            fs.delete(&name).unwrap();
                            model.remove(&name);
                        }
                        Err(e) => panic!("truncate failed: {}", e),
                    }
                }
            }
            FileOp::Delete { name } => {
                let name = name_of(name);
                assert_eq!(fs.delete(&name).is_ok(), model.remove(&name).is_some());
            }
            FileOp::Rename { from, to } => {
                let (from, to) = (name_of(from), name_of(to));
                if from != to && model.contains_key(&from) && !model.contains_key(&to) {
                    match fs.move_file(&from, &to) {
                        Ok(()) => {
                            let contents = model.remove(&from).unwrap();
                            model.insert(to, contents);
                        }
                        Err(FlashError::DiskFull) => {}
                        Err(e) => panic!("rename failed: {}", e),
                    }
                }
            }
            FileOp::Compact => {
                fs.compact().unwrap();
                assert_eq!(fs.get_stats().unwrap().orphaned_clusters, 0);
            }
            FileOp::Remount => fs.mount().unwrap(),
        }
    }

    assert_eq!(fs.get_files().unwrap(), model.keys().cloned().collect::<Vec<_>>());
    for (name, contents) in &model {
        assert_eq!(&fs.read_all_bytes(name).unwrap(), contents);
    }
});
