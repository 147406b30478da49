use flate2::{Compress, Compression, FlushCompress};
use tenbox_storage::{
    detect_format, DiskError, DiskFormat, MemBackend, Qcow2Disk, RawDisk, StorageBackend,
    VirtualDisk, SECTOR_SIZE,
};

const OFLAG_COPIED: u64 = 1 << 63;
const OFLAG_COMPRESSED: u64 = 1 << 62;

const CLUSTER_BITS: u32 = 16; // 64 KiB clusters, as the common qemu default
const CLUSTER: u64 = 1 << CLUSTER_BITS;

fn write_be_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

fn write_be_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

/// Minimal v3 image: header cluster, L1 cluster, one L2 cluster.
fn make_qcow2_empty(virtual_size: u64) -> MemBackend {
    let l1_table_offset = CLUSTER;
    let l2_table_offset = CLUSTER * 2;

    let mut backend = MemBackend::with_len(CLUSTER * 3).unwrap();

    let mut header = [0u8; 104];
    header[0..4].copy_from_slice(b"QFI\xfb");
    write_be_u32(&mut header, 4, 3); // version
    write_be_u32(&mut header, 20, CLUSTER_BITS);
    write_be_u64(&mut header, 24, virtual_size);
    write_be_u32(&mut header, 36, 1); // l1_size
    write_be_u64(&mut header, 40, l1_table_offset);
    write_be_u32(&mut header, 100, 104); // header_length
    backend.write_at(0, &header).unwrap();

    let l1_entry = l2_table_offset | OFLAG_COPIED;
    backend.write_at(l1_table_offset, &l1_entry.to_be_bytes()).unwrap();

    backend
}

fn deflate_raw(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; data.len() + 64];
    let mut c = Compress::new(Compression::default(), false);
    c.compress(data, &mut out, FlushCompress::Finish).unwrap();
    out.truncate(c.total_out() as usize);
    out
}

/// Image with a compressed cluster mapped at guest cluster 2.
fn make_qcow2_with_compressed_cluster(pattern: u8) -> MemBackend {
    let mut backend = make_qcow2_empty(64 * CLUSTER);
    let l2_table_offset = CLUSTER * 2;

    let cluster = vec![pattern; CLUSTER as usize];
    let compressed = deflate_raw(&cluster);
    let comp_offset = CLUSTER * 3;
    backend.set_len(CLUSTER * 4).unwrap();
    backend.write_at(comp_offset, &compressed).unwrap();

    let nb_bits = CLUSTER_BITS - 8;
    let nb_csectors = (compressed.len() as u64).div_ceil(512);
    let entry = OFLAG_COMPRESSED | (comp_offset << nb_bits) | (nb_csectors - 1);
    backend.write_at(l2_table_offset + 2 * 8, &entry.to_be_bytes()).unwrap();

    backend
}

#[test]
fn unallocated_clusters_read_zero() {
    let mut disk = Qcow2Disk::open(make_qcow2_empty(64 << 20)).unwrap();
    let mut buf = vec![0xAAu8; CLUSTER as usize];
    disk.read_at(CLUSTER, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn write_then_read_roundtrips() {
    let mut disk = Qcow2Disk::open(make_qcow2_empty(64 << 20)).unwrap();
    let data = vec![0xAAu8; CLUSTER as usize];
    disk.write_at(0, &data).unwrap();

    let mut back = vec![0u8; CLUSTER as usize];
    disk.read_at(0, &mut back).unwrap();
    assert_eq!(back, data);

    // The neighbouring cluster stays sparse.
    let mut next = vec![0xFFu8; CLUSTER as usize];
    disk.read_at(CLUSTER, &mut next).unwrap();
    assert!(next.iter().all(|b| *b == 0));
}

#[test]
fn write_straddling_cluster_boundary_roundtrips() {
    let mut disk = Qcow2Disk::open(make_qcow2_empty(64 << 20)).unwrap();
    let data: Vec<u8> = (0..(CLUSTER as usize * 2)).map(|i| i as u8).collect();
    let offset = CLUSTER / 2;
    disk.write_at(offset, &data).unwrap();

    let mut back = vec![0u8; data.len()];
    disk.read_at(offset, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn partial_write_preserves_rest_of_cluster() {
    let mut disk = Qcow2Disk::open(make_qcow2_empty(64 << 20)).unwrap();
    let fill = vec![0xEEu8; CLUSTER as usize];
    disk.write_at(0, &fill).unwrap();

    disk.write_at(123, &[1, 2, 3, 4]).unwrap();

    let mut back = vec![0u8; CLUSTER as usize];
    disk.read_at(0, &mut back).unwrap();
    assert!(back[..123].iter().all(|b| *b == 0xEE));
    assert_eq!(&back[123..127], &[1, 2, 3, 4]);
    assert!(back[127..].iter().all(|b| *b == 0xEE));
}

#[test]
fn compressed_cluster_reads_decompress() {
    let mut disk = Qcow2Disk::open(make_qcow2_with_compressed_cluster(0x5A)).unwrap();
    let mut buf = vec![0u8; CLUSTER as usize];
    disk.read_at(2 * CLUSTER, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0x5A));

    // Sub-cluster reads land mid-cluster.
    let mut small = [0u8; 16];
    disk.read_at(2 * CLUSTER + 1000, &mut small).unwrap();
    assert!(small.iter().all(|b| *b == 0x5A));
}

#[test]
fn write_to_compressed_cluster_copies_then_writes() {
    let mut disk = Qcow2Disk::open(make_qcow2_with_compressed_cluster(0x5A)).unwrap();

    // Partial write: untouched bytes must come from the decompressed old
    // contents.
    disk.write_at(2 * CLUSTER + 10, &[9, 9, 9]).unwrap();
    let mut buf = vec![0u8; CLUSTER as usize];
    disk.read_at(2 * CLUSTER, &mut buf).unwrap();
    assert!(buf[..10].iter().all(|b| *b == 0x5A));
    assert_eq!(&buf[10..13], &[9, 9, 9]);
    assert!(buf[13..].iter().all(|b| *b == 0x5A));

    // Full-cluster write replaces everything.
    let fresh = vec![0x11u8; CLUSTER as usize];
    disk.write_at(2 * CLUSTER, &fresh).unwrap();
    disk.read_at(2 * CLUSTER, &mut buf).unwrap();
    assert_eq!(buf, fresh);
}

#[test]
fn writes_persist_across_reopen() {
    let mut disk = Qcow2Disk::open(make_qcow2_empty(64 << 20)).unwrap();
    let data = vec![0x5Au8; SECTOR_SIZE * 3];
    disk.write_at(SECTOR_SIZE as u64, &data).unwrap();
    let backend = disk.into_backend().unwrap();

    let mut reopened = Qcow2Disk::open(backend).unwrap();
    let mut back = vec![0u8; data.len()];
    reopened.read_at(SECTOR_SIZE as u64, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn allocations_extend_file_at_cluster_boundaries() {
    let mut disk = Qcow2Disk::open(make_qcow2_empty(64 << 20)).unwrap();
    disk.write_at(0, &[1u8]).unwrap();
    disk.flush().unwrap();
    let mut backend = disk.into_backend().unwrap();
    assert_eq!(backend.len().unwrap() % CLUSTER, 0);
    // header + l1 + l2 + one data cluster
    assert_eq!(backend.len().unwrap(), CLUSTER * 4);
}

#[test]
fn new_l2_table_persists_l1_entry_with_copied_bit() {
    // Image whose L1 is empty: no preallocated L2 table.
    let l1_table_offset = CLUSTER;
    let mut backend = MemBackend::with_len(CLUSTER * 2).unwrap();
    let mut header = [0u8; 104];
    header[0..4].copy_from_slice(b"QFI\xfb");
    write_be_u32(&mut header, 4, 3);
    write_be_u32(&mut header, 20, CLUSTER_BITS);
    write_be_u64(&mut header, 24, 64 << 20);
    write_be_u32(&mut header, 36, 1);
    write_be_u64(&mut header, 40, l1_table_offset);
    write_be_u32(&mut header, 100, 104);
    backend.write_at(0, &header).unwrap();

    let mut disk = Qcow2Disk::open(backend).unwrap();
    disk.write_at(0, &[7u8; 512]).unwrap();
    disk.flush().unwrap();
    let mut backend = disk.into_backend().unwrap();

    let mut l1_raw = [0u8; 8];
    backend.read_at(l1_table_offset, &mut l1_raw).unwrap();
    let l1_entry = u64::from_be_bytes(l1_raw);
    assert_ne!(l1_entry, 0);
    assert_ne!(l1_entry & OFLAG_COPIED, 0);
    // The L2 table was allocated right after the original end of file.
    assert_eq!(l1_entry & !(OFLAG_COPIED), CLUSTER * 2);
}

#[test]
fn rejects_bad_magic() {
    let mut backend = MemBackend::with_len(104).unwrap();
    backend.write_at(0, b"NOPE").unwrap();
    assert!(matches!(
        Qcow2Disk::open(backend),
        Err(DiskError::CorruptImage("qcow2 bad magic"))
    ));
}

#[test]
fn rejects_backing_file() {
    let mut backend = make_qcow2_empty(64 << 20);
    backend.write_at(8, &1u64.to_be_bytes()).unwrap();
    assert!(matches!(
        Qcow2Disk::open(backend),
        Err(DiskError::Unsupported("qcow2 backing file"))
    ));
}

#[test]
fn rejects_encryption() {
    let mut backend = make_qcow2_empty(64 << 20);
    backend.write_at(32, &1u32.to_be_bytes()).unwrap();
    assert!(matches!(
        Qcow2Disk::open(backend),
        Err(DiskError::Unsupported("qcow2 encryption"))
    ));
}

#[test]
fn rejects_bad_cluster_bits() {
    for bad in [8u32, 22] {
        let mut backend = make_qcow2_empty(64 << 20);
        backend.write_at(20, &bad.to_be_bytes()).unwrap();
        assert!(matches!(
            Qcow2Disk::open(backend),
            Err(DiskError::CorruptImage("qcow2 invalid cluster_bits"))
        ));
    }
}

#[test]
fn rejects_unknown_version() {
    let mut backend = make_qcow2_empty(64 << 20);
    backend.write_at(4, &4u32.to_be_bytes()).unwrap();
    assert!(matches!(
        Qcow2Disk::open(backend),
        Err(DiskError::Unsupported("qcow2 version"))
    ));
}

#[test]
fn version_2_header_is_accepted() {
    let mut backend = make_qcow2_empty(64 << 20);
    backend.write_at(4, &2u32.to_be_bytes()).unwrap();
    let disk = Qcow2Disk::open(backend).unwrap();
    assert_eq!(disk.version(), 2);
}

#[test]
fn reads_and_writes_past_virtual_size_fail() {
    let mut disk = Qcow2Disk::open(make_qcow2_empty(1 << 20)).unwrap();
    let mut buf = [0u8; 512];
    assert!(matches!(
        disk.read_at((1 << 20) - 256, &mut buf),
        Err(DiskError::OutOfBounds { .. })
    ));
    assert!(matches!(
        disk.write_at(1 << 20, &buf),
        Err(DiskError::OutOfBounds { .. })
    ));
}

#[test]
fn many_l2_tables_cycle_through_the_cache() {
    // One L2 table covers l2_entries * CLUSTER bytes; touch enough distinct
    // L1 slots to force LRU eviction and write-back, then verify contents.
    let l2_span = (CLUSTER / 8) * CLUSTER;
    let slots = 20u64;
    let virtual_size = l2_span * slots;

    let l1_table_offset = CLUSTER;
    let mut backend = MemBackend::with_len(CLUSTER * 2).unwrap();
    let mut header = [0u8; 104];
    header[0..4].copy_from_slice(b"QFI\xfb");
    write_be_u32(&mut header, 4, 3);
    write_be_u32(&mut header, 20, CLUSTER_BITS);
    write_be_u64(&mut header, 24, virtual_size);
    write_be_u32(&mut header, 36, slots as u32);
    write_be_u64(&mut header, 40, l1_table_offset);
    write_be_u32(&mut header, 100, 104);
    backend.write_at(0, &header).unwrap();

    let mut disk = Qcow2Disk::open(backend).unwrap();
    for i in 0..slots {
        disk.write_at(i * l2_span, &[i as u8 + 1; 512]).unwrap();
    }
    for i in 0..slots {
        let mut buf = [0u8; 512];
        disk.read_at(i * l2_span, &mut buf).unwrap();
        assert_eq!(buf, [i as u8 + 1; 512], "slot {i}");
    }
}

#[test]
fn raw_disk_round_trips_and_bounds_checks() {
    let mut disk = RawDisk::create(MemBackend::new(), 1 << 20).unwrap();
    let data = vec![0x42u8; 4096];
    disk.write_at(8 * SECTOR_SIZE as u64, &data).unwrap();
    let mut back = vec![0u8; data.len()];
    disk.read_at(8 * SECTOR_SIZE as u64, &mut back).unwrap();
    assert_eq!(back, data);
    assert!(disk.write_at((1 << 20) - 100, &data).is_err());
}

#[test]
fn format_detection_by_magic() {
    let mut qcow2 = make_qcow2_empty(64 << 20);
    assert_eq!(detect_format(&mut qcow2).unwrap(), DiskFormat::Qcow2);
    let mut raw = MemBackend::with_len(1 << 20).unwrap();
    assert_eq!(detect_format(&mut raw).unwrap(), DiskFormat::Raw);
}
