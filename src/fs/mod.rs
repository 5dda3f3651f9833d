//! FUSE passthrough layer with write interception.
//!
//! Every operation except `write` forwards to the backing directory
//! unchanged. `write` runs the JIT backup manager and then the detector
//! before touching the backing store; a block verdict surfaces to the
//! caller as EIO, indistinguishable from a storage failure. Opens reply
//! with FOPEN_DIRECT_IO so the kernel page cache never absorbs a write
//! or serves a stale read.

mod inode;
mod passthrough;

use crate::backup::BackupManager;
use crate::config::Config;
use crate::detector::{Detector, Verdict};
use crate::stats::Stats;
use anyhow::Context;
use fuser::{
    Errno, FileAttr, FileHandle, Filesystem, FopenFlags, Generation, INodeNo, KernelConfig,
    LockOwner, MountOption, OpenFlags, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, RenameFlags, Request, TimeOrNow, WriteFlags,
};
use inode::{InodeTable, ROOT_INO};
use passthrough::{fstat, lstat, path_to_cstring, stat_to_file_attr};
use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const TTL: Duration = Duration::from_secs(1);

/// The stacking filesystem: passthrough plus the write-path core.
pub struct SentinelFs {
    storage_root: PathBuf,
    detector: Detector,
    backup: BackupManager,
    stats: Arc<Stats>,
    inodes: InodeTable,
}

impl SentinelFs {
    /// Build the filesystem over `storage_root`.
    ///
    /// Canonicalizes the storage path, opens the content classifier and
    /// creates the backup directory; any failure aborts before mounting.
    pub fn new(storage_root: PathBuf, config: &Config) -> anyhow::Result<Self> {
        let storage_root = storage_root
            .canonicalize()
            .with_context(|| format!("invalid storage path {}", storage_root.display()))?;

        let stats = Arc::new(Stats::new());
        let detector = Detector::new(config.detection.entropy_threshold, Arc::clone(&stats))?;
        let backup = BackupManager::new(
            storage_root.join(&config.backup.dir_name),
            config.backup.size_limit,
            Arc::clone(&stats),
        )?;

        Ok(Self {
            storage_root,
            detector,
            backup,
            stats,
            inodes: InodeTable::new(),
        })
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn backing_path(&self, rel: &Path) -> PathBuf {
        self.storage_root.join(rel)
    }

    /// Resolve a (parent inode, name) pair to relative and backing paths.
    fn resolve(&self, parent: u64, name: &OsStr) -> Option<(PathBuf, PathBuf)> {
        let parent_rel = self.inodes.path(parent)?;
        let rel = parent_rel.join(name);
        let full = self.backing_path(&rel);
        Some((rel, full))
    }

    /// Stat a backing path and register it in the inode table.
    fn register(&self, rel: &Path, full: &Path) -> std::io::Result<FileAttr> {
        let st = lstat(full)?;
        let mut attr = stat_to_file_attr(&st);
        if rel.as_os_str().is_empty() {
            attr.ino = INodeNo(ROOT_INO);
        } else {
            self.inodes.insert(u64::from(attr.ino), rel.to_path_buf());
        }
        Ok(attr)
    }

    /// The write interceptor. Ordering is strict: backup (offset-zero
    /// writes only), then detection, then the backing write. A blocked
    /// write never opens the backing file.
    pub(crate) fn intercept_write(
        &self,
        backing: &Path,
        data: &[u8],
        offset: u64,
    ) -> Result<u32, Errno> {
        if offset == 0 {
            self.backup.maybe_backup(backing);
        }

        if self.detector.scan(data).verdict == Verdict::Block {
            return Err(Errno::EIO);
        }

        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(backing)
            .map_err(Errno::from)?;
        let written = file.write_at(data, offset).map_err(Errno::from)?;
        Ok(written as u32)
    }
}

impl Filesystem for SentinelFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        info!(
            "sentinelfs mounted, storage={} threshold={:.1}",
            self.storage_root.display(),
            self.detector.threshold()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        self.stats.report();
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let (rel, full) = match self.resolve(u64::from(parent), name) {
            Some(paths) => paths,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        match self.register(&rel, &full) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let ino = u64::from(ino);
        let rel = match self.inodes.path(ino) {
            Some(rel) => rel,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        match lstat(&self.backing_path(&rel)) {
            Ok(st) => {
                let mut attr = stat_to_file_attr(&st);
                attr.ino = INodeNo(ino);
                reply.attr(&TTL, &attr);
            }
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<fuser::BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let ino = u64::from(ino);
        let rel = match self.inodes.path(ino) {
            Some(rel) => rel,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let full = self.backing_path(&rel);
        let c_path = match path_to_cstring(&full) {
            Ok(c) => c,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        if let Some(new_size) = size {
            let rc = unsafe { libc::truncate(c_path.as_ptr(), new_size as libc::off_t) };
            if rc != 0 {
                reply.error(Errno::from(std::io::Error::last_os_error()));
                return;
            }
        }

        if let Some(mode) = mode {
            let rc = unsafe { libc::chmod(c_path.as_ptr(), mode as libc::mode_t) };
            if rc != 0 {
                reply.error(Errno::from(std::io::Error::last_os_error()));
                return;
            }
        }

        if uid.is_some() || gid.is_some() {
            let new_uid = uid.map(|u| u as libc::uid_t).unwrap_or(libc::uid_t::MAX);
            let new_gid = gid.map(|g| g as libc::gid_t).unwrap_or(libc::gid_t::MAX);
            let rc = unsafe { libc::chown(c_path.as_ptr(), new_uid, new_gid) };
            if rc != 0 {
                reply.error(Errno::from(std::io::Error::last_os_error()));
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let to_timespec = |t: Option<TimeOrNow>| -> libc::timespec {
                match t {
                    Some(TimeOrNow::SpecificTime(st)) => {
                        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
                        libc::timespec {
                            tv_sec: d.as_secs() as libc::time_t,
                            tv_nsec: d.subsec_nanos() as libc::c_long,
                        }
                    }
                    Some(TimeOrNow::Now) => libc::timespec {
                        tv_sec: 0,
                        tv_nsec: libc::UTIME_NOW,
                    },
                    None => libc::timespec {
                        tv_sec: 0,
                        tv_nsec: libc::UTIME_OMIT,
                    },
                }
            };
            let times = [to_timespec(atime), to_timespec(mtime)];
            let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
            if rc != 0 {
                reply.error(Errno::from(std::io::Error::last_os_error()));
                return;
            }
        }

        match lstat(&full) {
            Ok(st) => {
                let mut attr = stat_to_file_attr(&st);
                attr.ino = INodeNo(ino);
                reply.attr(&TTL, &attr);
            }
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let rel = match self.inodes.path(u64::from(ino)) {
            Some(rel) => rel,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let full = self.backing_path(&rel);
        let c_path = match path_to_cstring(&full) {
            Ok(c) => c,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        // Probe only: handles are stateless, each read/write reopens the
        // backing file at its own offset.
        let fd = unsafe { libc::open(c_path.as_ptr(), flags.0) };
        if fd < 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }
        unsafe { libc::close(fd) };

        reply.opened(FileHandle(0), FopenFlags::FOPEN_DIRECT_IO);
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let rel = match self.inodes.path(u64::from(ino)) {
            Some(rel) => rel,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        let file = match File::open(self.backing_path(&rel)) {
            Ok(f) => f,
            Err(e) => {
                reply.error(Errno::from(e));
                return;
            }
        };

        let mut buf = vec![0u8; size as usize];
        match file.read_at(&mut buf, offset) {
            Ok(n) => {
                buf.truncate(n);
                reply.data(&buf);
            }
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let rel = match self.inodes.path(u64::from(ino)) {
            Some(rel) => rel,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        debug!("write {} offset={} len={}", rel.display(), offset, data.len());

        match self.intercept_write(&self.backing_path(&rel), data, offset) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let (rel, full) = match self.resolve(u64::from(parent), name) {
            Some(paths) => paths,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let c_path = match path_to_cstring(&full) {
            Ok(c) => c,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CREAT, mode) };
        if fd < 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        let st = fstat(fd);
        unsafe { libc::close(fd) };
        match st {
            Ok(st) => {
                let attr = stat_to_file_attr(&st);
                self.inodes.insert(u64::from(attr.ino), rel);
                reply.created(&TTL, &attr, Generation(0), FileHandle(0), FopenFlags::FOPEN_DIRECT_IO);
            }
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let (rel, full) = match self.resolve(u64::from(parent), name) {
            Some(paths) => paths,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let c_path = match path_to_cstring(&full) {
            Ok(c) => c,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let rc = unsafe { libc::mkdir(c_path.as_ptr(), mode as libc::mode_t) };
        if rc != 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        match self.register(&rel, &full) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let (rel, full) = match self.resolve(u64::from(parent), name) {
            Some(paths) => paths,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let c_path = match path_to_cstring(&full) {
            Ok(c) => c,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let rc = unsafe { libc::unlink(c_path.as_ptr()) };
        if rc != 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        self.inodes.forget_path(&rel);
        reply.ok();
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let (rel, full) = match self.resolve(u64::from(parent), name) {
            Some(paths) => paths,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let c_path = match path_to_cstring(&full) {
            Ok(c) => c,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let rc = unsafe { libc::rmdir(c_path.as_ptr()) };
        if rc != 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        self.inodes.forget_path(&rel);
        reply.ok();
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let (old_rel, old_full) = match self.resolve(u64::from(parent), name) {
            Some(paths) => paths,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let (new_rel, new_full) = match self.resolve(u64::from(newparent), newname) {
            Some(paths) => paths,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        let old_c = match path_to_cstring(&old_full) {
            Ok(c) => c,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };
        let new_c = match path_to_cstring(&new_full) {
            Ok(c) => c,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let rc = unsafe { libc::rename(old_c.as_ptr(), new_c.as_ptr()) };
        if rc != 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        self.inodes.rename(&old_rel, &new_rel);
        reply.ok();
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let ino = u64::from(ino);
        let rel = match self.inodes.path(ino) {
            Some(rel) => rel,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let full = self.backing_path(&rel);

        let dir = match std::fs::read_dir(&full) {
            Ok(dir) => dir,
            Err(e) => {
                reply.error(Errno::from(e));
                return;
            }
        };

        let parent_ino = match rel.parent() {
            Some(parent) => self.inodes.ino(parent).unwrap_or(ROOT_INO),
            None => ROOT_INO,
        };

        let mut entries: Vec<(u64, fuser::FileType, String)> = vec![
            (ino, fuser::FileType::Directory, ".".to_string()),
            (parent_ino, fuser::FileType::Directory, "..".to_string()),
        ];

        for entry in dir.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = rel.join(&name);
            if let Ok(st) = lstat(&self.backing_path(&child_rel)) {
                let attr = stat_to_file_attr(&st);
                self.inodes.insert(u64::from(attr.ino), child_rel);
                entries.push((u64::from(attr.ino), attr.kind, name));
            }
        }

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(INodeNo(*entry_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// Mount the filesystem and block until it is unmounted.
pub fn mount(fs: SentinelFs, mountpoint: &Path, config: &Config) -> anyhow::Result<()> {
    let mut options = vec![
        MountOption::FSName("sentinelfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if config.mount.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let mut fuser_config = fuser::Config::default();
    fuser_config.mount_options = options;
    fuser_config.acl = if config.mount.allow_other {
        fuser::SessionACL::All
    } else {
        fuser::SessionACL::Owner
    };

    fuser::mount(fs, mountpoint, &fuser_config)
        .with_context(|| format!("failed to mount at {}", mountpoint.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::test_support::lcg_bytes;
    use tempfile::{tempdir, TempDir};

    fn test_fs(config: &Config) -> (TempDir, SentinelFs) {
        let storage = tempdir().unwrap();
        let fs = SentinelFs::new(storage.path().to_path_buf(), config).unwrap();
        (storage, fs)
    }

    fn backups_in(storage: &Path, config: &Config) -> Vec<PathBuf> {
        std::fs::read_dir(storage.join(&config.backup.dir_name))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[test]
    fn plain_text_write_lands_in_backing_store() {
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("hello.txt");
        std::fs::write(&target, b"").unwrap();

        let data = b"Hello from SentinelFS\n";
        let written = fs.intercept_write(&target, data, 0).unwrap();
        assert_eq!(written, data.len() as u32);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert_eq!(fs.stats().total_writes(), 1);
        assert_eq!(fs.stats().blocked_writes(), 0);
    }

    #[test]
    fn written_range_reads_back_identically() {
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("offsets.txt");
        std::fs::write(&target, b"0123456789").unwrap();

        fs.intercept_write(&target, b"abc", 4).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"0123abc789");
    }

    #[test]
    fn pseudo_random_write_is_blocked() {
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("victim.dat");
        std::fs::write(&target, b"").unwrap();

        let err = fs.intercept_write(&target, &lcg_bytes(1024), 0).unwrap_err();
        assert_eq!(err, Errno::EIO);
        // Nothing reached the backing store.
        assert_eq!(std::fs::read(&target).unwrap(), b"");
        assert_eq!(fs.stats().blocked_writes(), 1);
    }

    #[test]
    fn spoofed_zip_header_is_blocked() {
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("fake.zip");
        std::fs::write(&target, b"").unwrap();

        let mut data = b"PK\x03\x04".to_vec();
        data.extend(lcg_bytes(1020));
        let err = fs.intercept_write(&target, &data, 0).unwrap_err();
        assert_eq!(err, Errno::EIO);
    }

    #[test]
    fn shebang_wrapper_is_allowed_despite_entropy() {
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("wrapper.sh");
        std::fs::write(&target, b"").unwrap();

        let mut data = b"#!/bin/sh\n".to_vec();
        data.extend(lcg_bytes(500));
        let written = fs.intercept_write(&target, &data, 0).unwrap();
        assert_eq!(written as usize, data.len());
        assert_eq!(fs.stats().blocked_writes(), 0);
    }

    #[test]
    fn first_write_preserves_the_preimage() {
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("notes.txt");
        let original = vec![b't'; 1000];
        std::fs::write(&target, &original).unwrap();

        fs.intercept_write(&target, b"short text", 0).unwrap();

        let backups = backups_in(storage.path(), &config);
        assert_eq!(backups.len(), 1);
        let name = backups[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("notes.txt."));
        assert!(name.ends_with(".backup"));
        assert_eq!(std::fs::read(&backups[0]).unwrap(), original);
        assert_eq!(fs.stats().backups_created(), 1);
    }

    #[test]
    fn nonzero_offset_does_not_trigger_backup() {
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("appended.log");
        std::fs::write(&target, b"existing content").unwrap();

        fs.intercept_write(&target, b" more", 16).unwrap();
        assert!(backups_in(storage.path(), &config).is_empty());
        assert_eq!(fs.stats().backups_created(), 0);
    }

    #[test]
    fn oversize_preimage_skips_backup_but_write_proceeds() {
        let mut config = Config::default();
        config.backup.size_limit = 100;
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("big.txt");
        std::fs::write(&target, vec![b'a'; 101]).unwrap();

        fs.intercept_write(&target, b"tiny text", 0).unwrap();
        assert!(backups_in(storage.path(), &config).is_empty());
        assert_eq!(fs.stats().backups_created(), 0);
    }

    #[test]
    fn blocked_write_still_gets_a_backup_first() {
        // Backup strictly precedes detection, so the pre-image survives
        // even when the incoming buffer is refused.
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("doc.txt");
        let original = b"precious document".to_vec();
        std::fs::write(&target, &original).unwrap();

        let err = fs.intercept_write(&target, &lcg_bytes(2048), 0).unwrap_err();
        assert_eq!(err, Errno::EIO);
        assert_eq!(std::fs::read(&target).unwrap(), original);

        let backups = backups_in(storage.path(), &config);
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read(&backups[0]).unwrap(), original);
    }

    #[test]
    fn missing_backing_file_reports_enoent() {
        let config = Config::default();
        let (storage, fs) = test_fs(&config);
        let target = storage.path().join("never-created");

        let err = fs.intercept_write(&target, b"text", 0).unwrap_err();
        assert_eq!(err, Errno::ENOENT);
    }
}
