use std::{
    io::{Seek, Write},
    path::PathBuf,
};

use rand::RngCore;
use tracing::info;

use crate::Args;

const CHUNK: usize = 1 << 20;

pub(crate) fn data_file_path(client: usize) -> PathBuf {
    PathBuf::from("data").join(format!("client_{client}.data"))
}

/// First eight bytes of a block: its file offset, little endian.
pub(crate) fn block_stamp(block: &[u8]) -> u64 {
    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&block[..8]);
    u64::from_le_bytes(stamp)
}

/// Create or extend every client's data file to `file_size_mib`. Each block of
/// `block_size` bytes starts with its own offset and is followed by random bytes.
///
/// Files written with a different block size fail `--validate`.
pub(crate) fn ensure_data_files(args: &Args) {
    std::fs::create_dir_all("data").unwrap();
    let block_size = args.block_size();
    std::thread::scope(|scope| {
        for client in 0..args.num_clients.get() as usize {
            let path = data_file_path(client);
            let existing = match std::fs::metadata(&path) {
                Ok(md) => md.len() / CHUNK as u64 * CHUNK as u64,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => panic!("cannot stat {path:?}: {e}"),
            };
            if existing >= args.file_size() {
                continue;
            }
            info!(?path, from = existing, to = args.file_size(), "filling data file");
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .unwrap();
            file.seek(std::io::SeekFrom::Start(existing)).unwrap();
            let end = args.file_size();
            scope.spawn(move || {
                let mut chunk = vec![0u8; CHUNK];
                let mut offset = existing;
                while offset < end {
                    rand::thread_rng().fill_bytes(&mut chunk);
                    for (i, block) in chunk.chunks_mut(block_size).enumerate() {
                        let block_offset = offset + (i * block_size) as u64;
                        block[..8].copy_from_slice(&block_offset.to_le_bytes());
                    }
                    file.write_all(&chunk).unwrap();
                    offset += CHUNK as u64;
                }
                file.sync_all().unwrap();
            });
        }
    });
}
