//! End-to-end container tests: lifecycle, persistence, growth, and the
//! historical regression scenarios.

use nestfs_core::layout::INODE_RECORD_SIZE;
use nestfs_core::{calculate_size, Block, Filesystem, Inode, OpenMode};
use nestfs_device::{Device, FileDevice, MemoryDevice};
use nestfs_error::EfsError;
use nestfs_types::{BlockId, EngineConfig, FsOptions, InodeId};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn opts(block_size: u32, block_count: u32, inode_count: u32) -> FsOptions {
    FsOptions {
        magic: b"engine-test".to_vec(),
        block_size,
        block_count,
        inode_count,
        filename_length: 32,
    }
}

fn mem() -> Box<dyn Device> {
    Box::new(MemoryDevice::new())
}

fn into_image(fs: Filesystem) -> Vec<u8> {
    let dev = fs.finalize().expect("finalize");
    dev.as_bytes().expect("memory device").to_vec()
}

#[test]
fn mkfs_size_matches_and_reopen_recomputes_layout() {
    let opt = opts(64, 8, 4);
    let fs = Filesystem::mkfs(opt.clone(), mem()).expect("mkfs");
    let created_layout = *fs.layout();

    let image = into_image(fs);
    assert_eq!(image.len() as u64, calculate_size(&opt).expect("size"));

    let fs = Filesystem::open(Box::new(MemoryDevice::from_vec(image))).expect("open");
    assert_eq!(*fs.layout(), created_layout);
    assert_eq!(fs.options(), &opt);
}

#[test]
fn write_and_read_back_across_block_boundaries() {
    let mut fs = Filesystem::mkfs(opts(32, 16, 4), mem()).expect("mkfs");
    let payload: Vec<u8> = (0..100_u8).collect();

    let mut h = fs.open_file(b"data", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &payload).expect("write");
    assert_eq!(fs.file_size(&h).expect("size"), 100);

    fs.seek(&mut h, SeekFrom::Start(0)).expect("seek");
    let mut back = vec![0_u8; 100];
    assert_eq!(fs.read(&mut h, &mut back).expect("read"), 100);
    assert_eq!(back, payload);

    // Odd-sized reads straddling block boundaries.
    fs.seek(&mut h, SeekFrom::Start(30)).expect("seek");
    let mut chunk = [0_u8; 7];
    assert_eq!(fs.read(&mut h, &mut chunk).expect("read"), 7);
    assert_eq!(&chunk, &payload[30..37]);

    // Reading at the end reports 0, not an error.
    fs.seek(&mut h, SeekFrom::End(0)).expect("seek");
    assert_eq!(fs.read(&mut h, &mut chunk).expect("read"), 0);

    fs.close(h).expect("close");
}

#[test]
fn truncate_preserves_bytes_below_the_cut() {
    // block size 128, 2 inodes, 3 blocks: the historical wipe-on-truncate
    // setup.
    let mut fs = Filesystem::mkfs(opts(128, 3, 2), mem()).expect("mkfs");

    let mut h = fs.open_file(b"rs1", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, b"abcd").expect("write");
    fs.write(&mut h, b"efgh").expect("write");

    fs.seek(&mut h, SeekFrom::Start(0)).expect("seek");
    let mut buf = [0_u8; 4];
    assert_eq!(fs.read(&mut h, &mut buf).expect("read"), 4);
    assert_eq!(&buf, b"abcd");

    fs.truncate(&mut h, 4).expect("truncate");
    assert_eq!(fs.file_size(&h).expect("size"), 4);

    fs.seek(&mut h, SeekFrom::Start(0)).expect("seek");
    assert_eq!(fs.read(&mut h, &mut buf).expect("read"), 4);
    assert_eq!(&buf, b"abcd");

    fs.close(h).expect("close");
}

#[test]
fn truncate_across_a_block_boundary_frees_the_tail() {
    let mut fs = Filesystem::mkfs(opts(32, 8, 4), mem()).expect("mkfs");
    let mut h = fs.open_file(b"long", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &[0xAA_u8; 100]).expect("write");

    let used_before: Vec<bool> = (1..=8).map(|b| fs.block_id_used(BlockId(b))).collect();
    assert_eq!(used_before.iter().filter(|&&u| u).count(), 4);

    fs.truncate(&mut h, 40).expect("truncate");
    let used_after = (1..=8).filter(|&b| fs.block_id_used(BlockId(b))).count();
    assert_eq!(used_after, 2);

    fs.seek(&mut h, SeekFrom::Start(0)).expect("seek");
    let mut back = vec![0_u8; 40];
    assert_eq!(fs.read(&mut h, &mut back).expect("read"), 40);
    assert!(back.iter().all(|&b| b == 0xAA));

    fs.close(h).expect("close");
}

#[test]
fn close_orders_of_sibling_files_are_all_safe() {
    for order in [[1_usize, 2, 0], [1, 0, 2]] {
        let mut fs = Filesystem::mkfs(opts(64, 8, 8), mem()).expect("mkfs");
        let names: [&[u8]; 3] = [b"rs1", b"rs2", b"rs3"];
        let mut handles: Vec<_> = names
            .iter()
            .map(|&n| fs.open_file(n, OpenMode::ReadWrite).expect("open"))
            .collect();
        for h in &mut handles {
            fs.write(h, b"payload").expect("write");
        }

        // Close rs2 first, then the remaining two in the given order.
        for &idx in &order {
            let h = handles.remove(
                handles
                    .iter()
                    .position(|h| h.inode() == InodeId(idx as u32 + 2))
                    .expect("handle present"),
            );
            fs.close(h).expect("close");
        }
        assert_eq!(fs.open_inode_count(), 0);

        // The container survives a reopen and every file reads back.
        let image = into_image(fs);
        let mut fs = Filesystem::open(Box::new(MemoryDevice::from_vec(image))).expect("reopen");
        for n in names {
            let mut h = fs.open_file(n, OpenMode::ReadOnly).expect("reopen file");
            let mut buf = [0_u8; 7];
            assert_eq!(fs.read(&mut h, &mut buf).expect("read"), 7);
            assert_eq!(&buf, b"payload");
            fs.close(h).expect("close");
        }
    }
}

#[test]
fn sibling_handles_on_one_inode_share_state_and_close_in_any_order() {
    for close_writer_first in [true, false] {
        let mut fs = Filesystem::mkfs(opts(64, 8, 4), mem()).expect("mkfs");
        let mut w = fs.open_file(b"shared", OpenMode::ReadWrite).expect("open");
        let mut r = fs.open_file(b"shared", OpenMode::ReadOnly).expect("open");

        fs.write(&mut w, b"visible").expect("write");
        // The reader observes the writer's bytes without a flush cycle.
        let mut buf = [0_u8; 7];
        assert_eq!(fs.read(&mut r, &mut buf).expect("read"), 7);
        assert_eq!(&buf, b"visible");
        assert_eq!(fs.file_size(&r).expect("size"), 7);

        if close_writer_first {
            fs.close(w).expect("close writer");
            fs.close(r).expect("close reader");
        } else {
            fs.close(r).expect("close reader");
            fs.close(w).expect("close writer");
        }
        assert_eq!(fs.open_inode_count(), 0);
    }
}

#[test]
fn reopen_leaves_untouched_files_byte_identical() {
    let mut fs = Filesystem::mkfs(opts(32, 16, 6), mem()).expect("mkfs");
    let keep: Vec<u8> = (0..80_u8).rev().collect();

    let mut h = fs.open_file(b"keep", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &keep).expect("write");
    fs.close(h).expect("close");
    let mut h = fs.open_file(b"churn", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &[0x55_u8; 60]).expect("write");
    fs.close(h).expect("close");

    // Reopen, rewrite only "churn", reopen again.
    let image = into_image(fs);
    let mut fs = Filesystem::open(Box::new(MemoryDevice::from_vec(image))).expect("reopen");
    let mut h = fs.open_file(b"churn", OpenMode::ReadWrite).expect("open");
    fs.truncate(&mut h, 0).expect("truncate");
    fs.write(&mut h, b"rewritten").expect("write");
    fs.close(h).expect("close");

    let image = into_image(fs);
    let mut fs = Filesystem::open(Box::new(MemoryDevice::from_vec(image))).expect("reopen");
    let mut h = fs.open_file(b"keep", OpenMode::ReadOnly).expect("open");
    let mut back = vec![0_u8; keep.len()];
    assert_eq!(fs.read(&mut h, &mut back).expect("read"), keep.len());
    assert_eq!(back, keep);
    fs.close(h).expect("close");
}

#[test]
fn bitsets_after_open_agree_with_on_disk_flags() {
    let mut fs = Filesystem::mkfs(opts(32, 16, 6), mem()).expect("mkfs");
    let mut h = fs.open_file(b"one", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &[1_u8; 10]).expect("write");
    fs.close(h).expect("close");
    let mut h = fs.open_file(b"three", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &[3_u8; 90]).expect("write");
    fs.close(h).expect("close");
    let image = into_image(fs);

    let fs =
        Filesystem::open(Box::new(MemoryDevice::from_vec(image.clone()))).expect("reopen");
    let layout = *fs.layout();
    let options = fs.options().clone();

    for raw in 1..=options.inode_count {
        let off = (layout.inode_table_offset
            + u64::from(raw - 1) * u64::from(INODE_RECORD_SIZE)) as usize;
        let node = Inode::decode(
            &image[off..off + INODE_RECORD_SIZE as usize],
            InodeId(raw),
        )
        .expect("decode inode");
        assert_eq!(
            fs.inode_id_used(InodeId(raw)),
            node.is_used(),
            "inode {raw} bitset disagrees with disk"
        );
    }
    let head_size = (layout.block_record_size - options.block_size) as usize;
    for raw in 1..=options.block_count {
        let off = (layout.block_table_offset
            + u64::from(raw - 1) * u64::from(layout.block_record_size)) as usize;
        let head = Block::decode(&image[off..off + head_size], BlockId(raw)).expect("decode block");
        assert_eq!(
            fs.block_id_used(BlockId(raw)),
            head.is_used(),
            "block {raw} bitset disagrees with disk"
        );
    }
}

/// Memory device that refuses to grow once armed, for failure injection.
struct GrowFailDevice {
    inner: MemoryDevice,
    fail_grow: Arc<AtomicBool>,
}

impl Device for GrowFailDevice {
    fn read(&mut self, buf: &mut [u8]) -> nestfs_error::Result<usize> {
        self.inner.read(buf)
    }
    fn write(&mut self, buf: &[u8]) -> nestfs_error::Result<usize> {
        self.inner.write(buf)
    }
    fn seek(&mut self, pos: SeekFrom) -> nestfs_error::Result<u64> {
        self.inner.seek(pos)
    }
    fn tell(&mut self) -> nestfs_error::Result<u64> {
        self.inner.tell()
    }
    fn truncate(&mut self, size: u64) -> nestfs_error::Result<()> {
        if self.fail_grow.load(Ordering::SeqCst) && size > self.inner.size()? {
            return Err(EfsError::Io(std::io::Error::other(
                "injected truncate failure",
            )));
        }
        self.inner.truncate(size)
    }
    fn flush(&mut self) -> nestfs_error::Result<()> {
        self.inner.flush()
    }
    fn size(&mut self) -> nestfs_error::Result<u64> {
        self.inner.size()
    }
    fn as_bytes(&self) -> Option<&[u8]> {
        self.inner.as_bytes()
    }
}

#[test]
fn append_blocks_grows_the_container() {
    let opt = opts(64, 8, 4);
    let mut fs = Filesystem::mkfs(opt.clone(), mem()).expect("mkfs");
    fs.append_blocks(4).expect("append");
    assert_eq!(fs.options().block_count, 12);

    let grown = FsOptions {
        block_count: 12,
        ..opt
    };
    let image = into_image(fs);
    assert_eq!(image.len() as u64, calculate_size(&grown).expect("size"));

    // The grown container opens cleanly and the new blocks are allocatable.
    let mut fs = Filesystem::open(Box::new(MemoryDevice::from_vec(image))).expect("reopen");
    let mut h = fs.open_file(b"big", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &vec![0x42_u8; 64 * 12]).expect("fill every block");
    fs.close(h).expect("close");
}

#[test]
fn failed_growth_rolls_back_to_a_consistent_container() {
    let opt = opts(64, 8, 4);
    let trigger = Arc::new(AtomicBool::new(false));
    let dev = GrowFailDevice {
        inner: MemoryDevice::new(),
        fail_grow: Arc::clone(&trigger),
    };
    let mut fs = Filesystem::mkfs(opt.clone(), Box::new(dev)).expect("mkfs");

    let mut h = fs.open_file(b"keep", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, b"payload").expect("write");
    fs.close(h).expect("close");

    trigger.store(true, Ordering::SeqCst);
    let err = fs.append_blocks(4).expect_err("growth must fail");
    assert!(matches!(err, EfsError::Io(_)));

    // In-memory geometry is untouched and the container still works.
    assert_eq!(fs.options().block_count, opt.block_count);
    let image = into_image(fs);
    assert_eq!(image.len() as u64, calculate_size(&opt).expect("size"));

    let mut fs = Filesystem::open(Box::new(MemoryDevice::from_vec(image))).expect("reopen");
    let mut h = fs.open_file(b"keep", OpenMode::ReadOnly).expect("open");
    let mut buf = [0_u8; 7];
    assert_eq!(fs.read(&mut h, &mut buf).expect("read"), 7);
    assert_eq!(&buf, b"payload");
    fs.close(h).expect("close");
}

#[test]
fn unlink_frees_the_chain_for_reuse() {
    let mut fs = Filesystem::mkfs(opts(32, 8, 4), mem()).expect("mkfs");
    let mut h = fs.open_file(b"victim", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &[7_u8; 100]).expect("write");

    // Unlinking an open file is refused.
    assert!(matches!(fs.unlink(b"victim"), Err(EfsError::Access(_))));
    fs.close(h).expect("close");

    fs.unlink(b"victim").expect("unlink");
    assert!(!fs.exists(b"victim").expect("exists"));
    assert_eq!((1..=8).filter(|&b| fs.block_id_used(BlockId(b))).count(), 0);

    // A new file reuses the freed space and reads back zeros-free.
    let mut h = fs.open_file(b"fresh", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, &[9_u8; 100]).expect("write");
    fs.seek(&mut h, SeekFrom::Start(0)).expect("seek");
    let mut back = [0_u8; 100];
    assert_eq!(fs.read(&mut h, &mut back).expect("read"), 100);
    assert!(back.iter().all(|&b| b == 9));
    fs.close(h).expect("close");
}

#[test]
fn sparse_write_reads_back_zeros_in_the_gap() {
    let mut fs = Filesystem::mkfs(opts(32, 8, 4), mem()).expect("mkfs");
    let mut h = fs.open_file(b"sparse", OpenMode::ReadWrite).expect("open");
    fs.seek(&mut h, SeekFrom::Start(70)).expect("seek");
    fs.write(&mut h, b"end").expect("write");
    assert_eq!(fs.file_size(&h).expect("size"), 73);

    fs.seek(&mut h, SeekFrom::Start(0)).expect("seek");
    let mut back = [0xFF_u8; 73];
    assert_eq!(fs.read(&mut h, &mut back).expect("read"), 73);
    assert!(back[..70].iter().all(|&b| b == 0));
    assert_eq!(&back[70..], b"end");
    fs.close(h).expect("close");
}

#[test]
fn lazy_cache_config_still_resolves_names() {
    let fs = Filesystem::mkfs(opts(64, 8, 4), mem()).expect("mkfs");
    let mut fs2 = {
        let image = into_image(fs);
        Filesystem::open_with_config(
            Box::new(MemoryDevice::from_vec(image)),
            EngineConfig {
                load_caches_on_open: false,
                use_name_cache: true,
            },
        )
        .expect("open")
    };
    let mut h = fs2.open_file(b"slow", OpenMode::ReadWrite).expect("create");
    fs2.write(&mut h, b"works").expect("write");
    fs2.close(h).expect("close");

    let mut h = fs2.open_file(b"slow", OpenMode::ReadOnly).expect("resolve");
    let mut buf = [0_u8; 5];
    assert_eq!(fs2.read(&mut h, &mut buf).expect("read"), 5);
    assert_eq!(&buf, b"works");
    fs2.close(h).expect("close");
}

#[test]
fn file_backed_container_survives_a_process_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("container.efs");

    let dev = FileDevice::create(&path).expect("create");
    let mut fs = Filesystem::mkfs(opts(64, 8, 4), Box::new(dev)).expect("mkfs");
    let mut h = fs.open_file(b"persisted", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, b"on disk").expect("write");
    fs.close(h).expect("close");
    fs.finalize().expect("finalize");

    let dev = FileDevice::open(&path).expect("open file");
    let mut fs = Filesystem::open(Box::new(dev)).expect("open fs");
    let mut h = fs.open_file(b"persisted", OpenMode::ReadOnly).expect("open");
    let mut buf = [0_u8; 7];
    assert_eq!(fs.read(&mut h, &mut buf).expect("read"), 7);
    assert_eq!(&buf, b"on disk");
    fs.close(h).expect("close");
    fs.finalize().expect("finalize");
}

#[test]
fn finalize_force_closes_surviving_handles() {
    let mut fs = Filesystem::mkfs(opts(64, 8, 4), mem()).expect("mkfs");
    let mut h = fs.open_file(b"left-open", OpenMode::ReadWrite).expect("open");
    fs.write(&mut h, b"data").expect("write");
    // Deliberately not closed.
    let image = {
        let dev = fs.finalize().expect("finalize");
        dev.as_bytes().expect("bytes").to_vec()
    };

    // The forced close cleared the open flags: the file reopens normally,
    // including for writing.
    let mut fs = Filesystem::open(Box::new(MemoryDevice::from_vec(image))).expect("reopen");
    let mut h = fs.open_file(b"left-open", OpenMode::ReadWrite).expect("open");
    let mut buf = [0_u8; 4];
    assert_eq!(fs.read(&mut h, &mut buf).expect("read"), 4);
    assert_eq!(&buf, b"data");
    fs.close(h).expect("close");
}
