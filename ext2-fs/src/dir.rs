//! Directory engine: linear scans over variable length directory records.

use alloc::string::String;
use alloc::vec::Vec;

use crate::block_cache::BlockRef;
use crate::config::{MAX_NAME_LEN, ROOT_INO};
use crate::error::{FileSystemError, FsResult};
use crate::ext2::Ext2FileSystem;
use crate::layout::{
    DIRENT_HEADER_SIZE, DirEntryHeader, DiskInode, dirent_kind, dirent_size, dirent_type, rec_len_from_disk,
    rec_len_to_disk,
};
use crate::vfs::{self, DirEntry, InodeType};

/// One record of a directory block.
#[derive(Debug, Clone)]
pub(crate) struct DirRecord {
    pub offset: usize,
    pub inode: u32,
    pub rec_len: usize,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirRecord {
    fn is_live(&self) -> bool {
        self.inode != 0
    }

    fn is_dot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }

    fn to_entry(&self) -> DirEntry {
        DirEntry {
            ino: self.inode,
            name: String::from_utf8_lossy(&self.name).into_owned(),
            file_type: dirent_kind(self.file_type),
        }
    }
}

/// Where a name was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirHit {
    pub ino: u32,
    pub file_type: u8,
    pub block_index: u32,
    pub offset: usize,
}

/// Split a directory block into records. `Err` carries the offset of the
/// first malformed record.
fn parse_block(data: &[u8]) -> Result<Vec<DirRecord>, usize> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        if offset + DIRENT_HEADER_SIZE > data.len() {
            return Err(offset);
        }
        let raw = &data[offset..offset + DIRENT_HEADER_SIZE];
        let inode = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let rec_len = rec_len_from_disk(u16::from_le_bytes([raw[4], raw[5]]));
        let name_len = raw[6] as usize;
        if rec_len < DIRENT_HEADER_SIZE
            || rec_len % 4 != 0
            || offset + rec_len > data.len()
            || DIRENT_HEADER_SIZE + name_len > rec_len
        {
            return Err(offset);
        }
        let name_start = offset + DIRENT_HEADER_SIZE;
        records.push(DirRecord {
            offset,
            inode,
            rec_len,
            file_type: raw[7],
            name: data[name_start..name_start + name_len].to_vec(),
        });
        offset += rec_len;
    }
    Ok(records)
}

fn write_record(block: &BlockRef<'_>, offset: usize, inode: u32, rec_len: usize, name: &[u8], file_type: u8) {
    block.set(
        offset,
        DirEntryHeader {
            inode,
            rec_len: rec_len_to_disk(rec_len),
            name_len: name.len() as u8,
            file_type,
        },
    );
    block.modify(|data| {
        let start = offset + DIRENT_HEADER_SIZE;
        data[start..start + name.len()].copy_from_slice(name);
    });
}

fn check_name(name: &[u8]) -> FsResult<()> {
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(FileSystemError::InvalidPath);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FileSystemError::NameTooLong);
    }
    Ok(())
}

impl Ext2FileSystem {
    fn dir_blocks(&self, dir: &DiskInode) -> u32 {
        (dir.size() / self.geo.block_size as u64) as u32
    }

    fn entry_type(&self, kind: InodeType) -> u8 {
        if self.geo.filetype { dirent_type(kind) } else { 0 }
    }

    /// Physical address and records of directory block `index`.
    fn dir_block(&self, dir: &DiskInode, index: u32) -> FsResult<(u32, Vec<DirRecord>)> {
        let phys = self.block_address(dir, index)?;
        if phys == 0 {
            return Err(self.corruption(format_args!("hole at block {} of a directory", index)));
        }
        match self.disk.reference(phys)?.read(|data| parse_block(data)) {
            Ok(records) => Ok((phys, records)),
            Err(offset) => Err(self.corruption(format_args!(
                "bad directory record in block {} at offset {}",
                phys, offset
            ))),
        }
    }

    /// Look `name` up in one directory.
    pub(crate) fn find_dirent(&self, dir: &DiskInode, name: &[u8]) -> FsResult<Option<DirHit>> {
        if !dir.is_dir() {
            return Err(FileSystemError::NotDirectory);
        }
        for index in 0..self.dir_blocks(dir) {
            let (_, records) = self.dir_block(dir, index)?;
            if let Some(rec) = records.iter().find(|r| r.is_live() && r.name == name) {
                return Ok(Some(DirHit {
                    ino: rec.inode,
                    file_type: rec.file_type,
                    block_index: index,
                    offset: rec.offset,
                }));
            }
        }
        Ok(None)
    }

    /// Resolve an absolute path to an inode number, one component at a
    /// time from the root. Symbolic links are not followed.
    pub(crate) fn lookup_path(&self, path: &str) -> FsResult<u32> {
        if !path.starts_with('/') {
            return Err(FileSystemError::InvalidPath);
        }
        let mut current = ROOT_INO;
        for component in vfs::components(path) {
            if component.len() > MAX_NAME_LEN {
                return Err(FileSystemError::NameTooLong);
            }
            let dir = self.load_inode(current)?;
            if !dir.is_dir() {
                return Err(FileSystemError::NotDirectory);
            }
            current = self
                .find_dirent(&dir, component.as_bytes())?
                .ok_or(FileSystemError::NotFound)?
                .ino;
        }
        Ok(current)
    }

    /// Add `name -> child` to `dir`, reusing a free record or the slack of a
    /// live one before growing the directory by a block.
    pub(crate) fn alloc_dirent(&self, dir: &mut DiskInode, dir_ino: u32, child: u32, name: &[u8], kind: InodeType) -> FsResult<()> {
        check_name(name)?;
        let needed = dirent_size(name.len());
        let file_type = self.entry_type(kind);
        for index in 0..self.dir_blocks(dir) {
            let (phys, records) = self.dir_block(dir, index)?;
            for rec in &records {
                if !rec.is_live() {
                    if rec.rec_len >= needed {
                        let block = self.disk.reference(phys)?;
                        write_record(&block, rec.offset, child, rec.rec_len, name, file_type);
                        return Ok(());
                    }
                    continue;
                }
                let used = dirent_size(rec.name.len());
                if rec.rec_len - used >= needed {
                    let block = self.disk.reference(phys)?;
                    write_record(&block, rec.offset, rec.inode, used, &rec.name, rec.file_type);
                    write_record(&block, rec.offset + used, child, rec.rec_len - used, name, file_type);
                    return Ok(());
                }
            }
        }

        // No room: append a block holding a single record.
        let index = self.dir_blocks(dir);
        let hint = self.inode_group_hint(dir_ino);
        let phys = self.map_new_block(dir, index, hint)?;
        let block = self.disk.reference(phys)?;
        write_record(&block, 0, child, self.geo.block_size, name, file_type);
        dir.set_size(dir.size() + self.geo.block_size as u64);
        log::debug!("ext2: directory {} grew to {} blocks", dir_ino, index + 1);
        Ok(())
    }

    /// Remove `name` from `dir` and return the inode it named. `.` and
    /// `..` can never be removed.
    pub(crate) fn free_dirent(&self, dir: &mut DiskInode, name: &[u8]) -> FsResult<u32> {
        if name == b"." || name == b".." {
            return Err(FileSystemError::InvalidArgument);
        }
        let blocks = self.dir_blocks(dir);
        for index in 0..blocks {
            let (phys, records) = self.dir_block(dir, index)?;
            let Some(pos) = records.iter().position(|r| r.is_live() && r.name == name) else {
                continue;
            };
            if index == 0 && pos < 2 {
                return Err(FileSystemError::InvalidArgument);
            }
            let rec = &records[pos];
            let in_last_block = index + 1 == blocks;
            let alone = !records.iter().enumerate().any(|(i, r)| i != pos && r.is_live());
            let next = records.get(pos + 1);

            if in_last_block && alone && index > 0 {
                // Drop the whole trailing block.
                let size = dir.size() - self.geo.block_size as u64;
                self.truncate_data(dir, size)?;
            } else if in_last_block && next.is_none() {
                let block = self.disk.reference(phys)?;
                write_record(&block, rec.offset, 0, rec.rec_len, &[], 0);
            } else if pos > 0 {
                let prev = &records[pos - 1];
                let block = self.disk.reference(phys)?;
                block.modify_at(prev.offset, |h: &mut DirEntryHeader| {
                    h.rec_len = rec_len_to_disk(prev.rec_len + rec.rec_len)
                });
            } else if let Some(next) = next {
                // First in its block: pull the following record over it.
                let block = self.disk.reference(phys)?;
                write_record(&block, rec.offset, next.inode, rec.rec_len + next.rec_len, &next.name, next.file_type);
            } else {
                let block = self.disk.reference(phys)?;
                write_record(&block, rec.offset, 0, rec.rec_len, &[], 0);
            }
            return Ok(rec.inode);
        }
        Err(FileSystemError::NotFound)
    }

    /// Point an existing entry at another inode.
    pub(crate) fn set_dirent(&self, dir: &DiskInode, name: &[u8], ino: u32, kind: InodeType) -> FsResult<()> {
        let hit = self.find_dirent(dir, name)?.ok_or(FileSystemError::NotFound)?;
        let phys = self.block_address(dir, hit.block_index)?;
        let file_type = self.entry_type(kind);
        self.disk.reference(phys)?.modify_at(hit.offset, |h: &mut DirEntryHeader| {
            h.inode = ino;
            h.file_type = file_type;
        });
        Ok(())
    }

    /// Write the first block of a new directory: `.` and `..`.
    pub(crate) fn init_dir(&self, dir: &mut DiskInode, ino: u32, parent: u32) -> FsResult<()> {
        let phys = self.map_new_block(dir, 0, self.inode_group_hint(ino))?;
        let block = self.disk.reference(phys)?;
        let dot = dirent_size(1);
        let file_type = self.entry_type(InodeType::Directory);
        write_record(&block, 0, ino, dot, b".", file_type);
        write_record(&block, dot, parent, self.geo.block_size - dot, b"..", file_type);
        dir.set_size(self.geo.block_size as u64);
        Ok(())
    }

    /// Only `.` and `..` left?
    pub(crate) fn dir_is_empty(&self, dir: &DiskInode) -> FsResult<bool> {
        for index in 0..self.dir_blocks(dir) {
            let (_, records) = self.dir_block(dir, index)?;
            if records.iter().any(|r| r.is_live() && !r.is_dot()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Live entries from byte position `pos`, at most `count` of them, and
    /// the position after the last one returned.
    pub(crate) fn list_dir(&self, dir: &DiskInode, pos: u64, count: usize) -> FsResult<(Vec<DirEntry>, u64)> {
        if !dir.is_dir() {
            return Err(FileSystemError::NotDirectory);
        }
        let bs = self.geo.block_size as u64;
        let mut entries = Vec::new();
        let first = (pos / bs) as u32;
        for index in first..self.dir_blocks(dir) {
            let (_, records) = self.dir_block(dir, index)?;
            let skip = if index == first { (pos % bs) as usize } else { 0 };
            for rec in records.iter().filter(|r| r.offset >= skip) {
                if entries.len() == count {
                    return Ok((entries, index as u64 * bs + rec.offset as u64));
                }
                if rec.is_live() {
                    entries.push(rec.to_entry());
                }
            }
        }
        Ok((entries, dir.size()))
    }

    /// The `n`-th live entry.
    pub(crate) fn nth_dirent(&self, dir: &DiskInode, n: usize) -> FsResult<Option<DirEntry>> {
        let (mut entries, _) = self.list_dir(dir, 0, n + 1)?;
        Ok(if entries.len() == n + 1 { entries.pop() } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext2::tests::{format_and_mount, small_config};
    use crate::layout::{FT_DIR, S_IFDIR};
    use alloc::format;
    use alloc::vec;

    fn names(fs: &Ext2FileSystem, dir: &DiskInode) -> Vec<String> {
        let (entries, _) = fs.list_dir(dir, 0, usize::MAX).unwrap();
        entries.into_iter().map(|e| e.name).collect()
    }

    fn new_dir(fs: &Ext2FileSystem) -> (u32, DiskInode) {
        let ino = fs.alloc_inode(0, true).unwrap();
        let mut dir = DiskInode { mode: S_IFDIR | 0o755, links_count: 2, ..Default::default() };
        fs.init_dir(&mut dir, ino, ino).unwrap();
        (ino, dir)
    }

    #[test]
    fn parse_rejects_bad_rec_len() {
        let mut block = vec![0u8; 1024];
        block[4..6].copy_from_slice(&6u16.to_le_bytes());
        assert_eq!(parse_block(&block).err(), Some(0));
        block[4..6].copy_from_slice(&1024u16.to_le_bytes());
        block[6] = 3;
        assert_eq!(parse_block(&block).unwrap().len(), 1);
    }

    #[test]
    fn fresh_directory_has_dot_entries() {
        let fs = format_and_mount(small_config());
        let (ino, dir) = new_dir(&fs);
        let (entries, next) = fs.list_dir(&dir, 0, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].name.as_str(), entries[0].ino), (".", ino));
        assert_eq!(entries[1].name, "..");
        assert_eq!(entries[1].file_type, Some(InodeType::Directory));
        assert_eq!(next, 1024);
        assert!(fs.dir_is_empty(&dir).unwrap());
    }

    #[test]
    fn insert_then_remove_restores_entries() {
        let fs = format_and_mount(small_config());
        let (ino, mut dir) = new_dir(&fs);
        fs.alloc_dirent(&mut dir, ino, 40, b"keep", InodeType::File).unwrap();
        let before = names(&fs, &dir);

        fs.alloc_dirent(&mut dir, ino, 41, b"temp", InodeType::File).unwrap();
        assert_eq!(fs.find_dirent(&dir, b"temp").unwrap().map(|h| h.ino), Some(41));
        assert_eq!(fs.free_dirent(&mut dir, b"temp").unwrap(), 41);

        assert_eq!(names(&fs, &dir), before);
        assert!(fs.find_dirent(&dir, b"temp").unwrap().is_none());
        assert_eq!(dir.size(), 1024);
    }

    #[test]
    fn growth_and_shrink_by_whole_blocks() {
        let fs = format_and_mount(small_config());
        let (ino, mut dir) = new_dir(&fs);
        // 60-byte names take 68-byte records: 14 fit after `.` and `..`.
        let long = |i: usize| format!("{:060}", i).into_bytes();
        for i in 0..15 {
            fs.alloc_dirent(&mut dir, ino, 100 + i as u32, &long(i), InodeType::File).unwrap();
        }
        assert_eq!(dir.size(), 2048);
        let hit = fs.find_dirent(&dir, &long(14)).unwrap().unwrap();
        assert_eq!((hit.block_index, hit.offset), (1, 0));

        // Only entry of the last block: the directory loses that block.
        fs.free_dirent(&mut dir, &long(14)).unwrap();
        assert_eq!(dir.size(), 1024);
        assert_eq!(names(&fs, &dir).len(), 16);
    }

    #[test]
    fn removal_cases_keep_records_consistent() {
        let fs = format_and_mount(small_config());
        let (ino, mut dir) = new_dir(&fs);
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            fs.alloc_dirent(&mut dir, ino, 50 + i as u32, name.as_bytes(), InodeType::File).unwrap();
        }
        // Middle entry merges into its predecessor.
        fs.free_dirent(&mut dir, b"b").unwrap();
        // Last entry of the directory is nulled in place.
        fs.free_dirent(&mut dir, b"d").unwrap();
        assert_eq!(names(&fs, &dir), [".", "..", "a", "c"]);

        // Record lengths still tile the block.
        let phys = fs.block_address(&dir, 0).unwrap();
        let records = fs.disk.reference(phys).unwrap().read(|d| parse_block(d)).unwrap();
        assert_eq!(records.iter().map(|r| r.rec_len).sum::<usize>(), 1024);

        // The slack left behind by b is reused first.
        fs.alloc_dirent(&mut dir, ino, 60, b"e", InodeType::File).unwrap();
        assert_eq!(names(&fs, &dir), [".", "..", "a", "e", "c"]);
    }

    #[test]
    fn first_record_of_block_pulls_next_over() {
        let fs = format_and_mount(small_config());
        let (ino, mut dir) = new_dir(&fs);
        let long = |i: usize| format!("{:060}", i).into_bytes();
        for i in 0..14 {
            fs.alloc_dirent(&mut dir, ino, 100 + i as u32, &long(i), InodeType::File).unwrap();
        }
        // A 48-byte record closes the last gap in block 0.
        fs.alloc_dirent(&mut dir, ino, 199, &[b'p'; 40], InodeType::File).unwrap();
        assert_eq!(dir.size(), 1024);
        // Block 1 gets x, then y is split off its slack.
        fs.alloc_dirent(&mut dir, ino, 200, b"x", InodeType::File).unwrap();
        fs.alloc_dirent(&mut dir, ino, 201, b"y", InodeType::File).unwrap();
        assert_eq!(dir.size(), 2048);

        fs.free_dirent(&mut dir, b"x").unwrap();
        let hit = fs.find_dirent(&dir, b"y").unwrap().unwrap();
        assert_eq!((hit.block_index, hit.offset), (1, 0));
        let phys = fs.block_address(&dir, 1).unwrap();
        let records = fs.disk.reference(phys).unwrap().read(|d| parse_block(d)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rec_len, 1024);
    }

    #[test]
    fn dot_entries_are_protected() {
        let fs = format_and_mount(small_config());
        let (_, mut dir) = new_dir(&fs);
        assert_eq!(fs.free_dirent(&mut dir, b"."), Err(FileSystemError::InvalidArgument));
        assert_eq!(fs.free_dirent(&mut dir, b".."), Err(FileSystemError::InvalidArgument));
        assert_eq!(fs.free_dirent(&mut dir, b"nope"), Err(FileSystemError::NotFound));
    }

    #[test]
    fn names_are_validated() {
        let fs = format_and_mount(small_config());
        let (ino, mut dir) = new_dir(&fs);
        let long = vec![b'n'; MAX_NAME_LEN + 1];
        assert_eq!(
            fs.alloc_dirent(&mut dir, ino, 9, &long, InodeType::File),
            Err(FileSystemError::NameTooLong)
        );
        assert_eq!(fs.alloc_dirent(&mut dir, ino, 9, b"a/b", InodeType::File), Err(FileSystemError::InvalidPath));
        assert_eq!(fs.alloc_dirent(&mut dir, ino, 9, b"", InodeType::File), Err(FileSystemError::InvalidPath));
    }

    #[test]
    fn getdents_resumes_at_position() {
        let fs = format_and_mount(small_config());
        let (ino, mut dir) = new_dir(&fs);
        for i in 0..5u32 {
            fs.alloc_dirent(&mut dir, ino, 70 + i, format!("f{}", i).as_bytes(), InodeType::File).unwrap();
        }
        let (first, pos) = fs.list_dir(&dir, 0, 3).unwrap();
        assert_eq!(first.len(), 3);
        let (rest, end) = fs.list_dir(&dir, pos, 10).unwrap();
        let all: Vec<_> = first.iter().chain(rest.iter()).map(|e| e.name.clone()).collect();
        assert_eq!(all, [".", "..", "f0", "f1", "f2", "f3", "f4"]);
        assert_eq!(end, 1024);
        assert_eq!(fs.nth_dirent(&dir, 4).unwrap().map(|e| e.ino), Some(72));
        assert_eq!(fs.nth_dirent(&dir, 7).unwrap(), None);
    }

    #[test]
    fn lookup_walks_from_root() {
        let fs = format_and_mount(small_config());
        assert_eq!(fs.lookup_path("/").unwrap(), ROOT_INO);
        let lost = fs.lookup_path("/lost+found").unwrap();
        assert_eq!(fs.lookup_path("/lost+found/..").unwrap(), ROOT_INO);
        assert_eq!(fs.lookup_path("/lost+found/.").unwrap(), lost);
        assert_eq!(fs.lookup_path("/missing"), Err(FileSystemError::NotFound));
        assert_eq!(fs.lookup_path("relative"), Err(FileSystemError::InvalidPath));
        let root = fs.load_inode(ROOT_INO).unwrap();
        assert_eq!(fs.find_dirent(&root, b"lost+found").unwrap().map(|h| h.file_type), Some(FT_DIR));
    }
}
