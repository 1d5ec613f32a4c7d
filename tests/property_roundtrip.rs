//! Property-based tests for file contents and operation sequences
//!
//! Uses proptest to check the file system against a plain in-memory model

mod common;

use common::{formatted, records, remount};
use flashlog_rs::{FlashError, FsConfig, Geometry, OpenMode};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::{Read, Write};

// 16 sectors x 8 clusters of 128 bytes: 96 data bytes in a header cluster,
// 121 in a data cluster
fn geometry() -> Geometry {
    Geometry::new(16 * 1024, 1024, 128)
}

#[derive(Debug, Clone)]
enum Op {
    Write(usize, Vec<u8>),
    Append(usize, Vec<u8>),
    Truncate(usize, usize),
    Delete(usize),
    Rename(usize, usize),
    Compact,
    Remount,
}

const NAMES: [&str; 4] = ["a.txt", "b.txt", "c.log", "d.bin"];
const MAX_FILE: usize = 400;

fn op_strategy() -> impl Strategy<Value = Op> {
    let name = 0..NAMES.len();
    prop_oneof![
        4 => (name.clone(), prop::collection::vec(any::<u8>(), 0..MAX_FILE))
            .prop_map(|(n, data)| Op::Write(n, data)),
        3 => (name.clone(), prop::collection::vec(any::<u8>(), 1..150))
            .prop_map(|(n, data)| Op::Append(n, data)),
        2 => (name.clone(), 0usize..MAX_FILE).prop_map(|(n, len)| Op::Truncate(n, len)),
        1 => name.clone().prop_map(Op::Delete),
        1 => (name.clone(), name).prop_map(|(from, to)| Op::Rename(from, to)),
        1 => Just(Op::Compact),
        1 => Just(Op::Remount),
    ]
}

proptest! {
    #[test]
    fn prop_chunked_writes_read_back(
        data in prop::collection::vec(any::<u8>(), 0..3000),
        chunk in 1usize..700,
        read_chunk in 1usize..500,
    ) {
        let (fs, _flash) = formatted(geometry(), FsConfig::default());
        {
            let mut file = fs.create("blob").unwrap();
            for piece in data.chunks(chunk) {
                file.write_all(piece).unwrap();
            }
        }

        prop_assert_eq!(fs.get_file_size("blob").unwrap(), data.len() as u64);

        let mut file = fs.open("blob", OpenMode::Open).unwrap();
        let mut back = Vec::new();
        let mut buf = vec![0u8; read_chunk];
        loop {
            let n = file.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            back.extend_from_slice(&buf[..n]);
        }
        prop_assert_eq!(back, data);
    }

    #[test]
    fn prop_operation_sequences_match_model(
        ops in prop::collection::vec(op_strategy(), 1..60)
    ) {
        let (mut fs, flash) = formatted(geometry(), FsConfig::default());
        let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Write(n, data) => {
                    fs.write_all_bytes(NAMES[n], &data).unwrap();
                    model.insert(NAMES[n].to_uppercase(), data);
                }
                Op::Append(n, data) => {
                    let key = NAMES[n].to_uppercase();
                    let current = model.get(&key).map_or(0, Vec::len);
                    if current + data.len() > MAX_FILE {
                        continue;
                    }
                    let mut file = fs.open(NAMES[n], OpenMode::Append).unwrap();
                    file.write_all(&data).unwrap();
                    model.entry(key).or_default().extend_from_slice(&data);
                }
                Op::Truncate(n, len) => {
                    let key = NAMES[n].to_uppercase();
                    let result = fs.open(NAMES[n], OpenMode::Open).and_then(|mut file| file.set_len(len as u64));
                    match model.get_mut(&key) {
                        Some(contents) if len <= contents.len() => {
                            prop_assert!(result.is_ok());
                            contents.truncate(len);
                        }
                        Some(_) => {
                            let refused = matches!(result, Err(FlashError::OutOfBounds { .. }));
                            prop_assert!(refused, "unexpected result {:?}", result);
                        }
                        None => {
                            let refused = matches!(result, Err(FlashError::FileNotFound(_)));
                            prop_assert!(refused, "unexpected result {:?}", result);
                        }
                    }
                }
                Op::Delete(n) => {
                    let result = fs.delete(NAMES[n]);
                    prop_assert_eq!(result.is_ok(), model.remove(&NAMES[n].to_uppercase()).is_some());
                }
                Op::Rename(from, to) => {
                    let (from_key, to_key) = (NAMES[from].to_uppercase(), NAMES[to].to_uppercase());
                    let result = fs.move_file(NAMES[from], NAMES[to]);
                    if !model.contains_key(&from_key) {
                        let refused = matches!(result, Err(FlashError::FileNotFound(_)));
                        prop_assert!(refused, "unexpected result {:?}", result);
                    } else if from == to {
                        prop_assert!(result.is_ok());
                    } else if model.contains_key(&to_key) {
                        let refused = matches!(result, Err(FlashError::FileAlreadyExists(_)));
                        prop_assert!(refused, "unexpected result {:?}", result);
                    } else {
                        prop_assert!(result.is_ok());
                        let contents = model.remove(&from_key).unwrap();
                        model.insert(to_key, contents);
                    }
                }
                Op::Compact => {
                    fs.compact().unwrap();
                    prop_assert_eq!(fs.get_stats().unwrap().orphaned_clusters, 0);
                }
                Op::Remount => {
                    let index = records(&fs);
                    fs = remount(&flash, FsConfig::default());
                    prop_assert_eq!(records(&fs), index);
                }
            }
        }

        prop_assert_eq!(fs.get_files().unwrap(), model.keys().cloned().collect::<Vec<_>>());
        for (name, contents) in &model {
            prop_assert_eq!(&fs.read_all_bytes(name).unwrap(), contents);
        }
    }
}
