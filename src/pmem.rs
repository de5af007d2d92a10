use crate::env_var::config;
use crate::error::{Error, Result};
use crate::globmem::{GlobalPtr, GPTR_NULL};
use crate::runtime::Runtime;
use crate::transport::Remote;

use parking_lot::Mutex;
use std::fs;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::{debug, warn};

pub const PMEM_FILE_CREATE: u32 = 0x1;
pub const PMEM_FILE_EXCL: u32 = 0x2;

const POOL_MAGIC: u64 = 0x4c41_545f_504d_4531_u64;

/// Object id of a bucket within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub u64);

#[derive(Debug, Clone, Copy)]
pub struct PoolStat {
    pub num_buckets: usize,
}

struct Bucket {
    oid: u64,
    data: Box<[u8]>,
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let end = cursor.checked_add(8)?;
    let chunk = bytes.get(*cursor..end)?;
    *cursor = end;
    Some(u64::from_le_bytes(chunk.try_into().ok()?))
}

/// A file-backed bucket pool standing in for an NVM region: buckets are
/// resident in memory and `persist` writes them through to the pool file.
pub struct PmemPool {
    path: PathBuf,
    buckets: Mutex<Vec<Bucket>>,
    next_oid: Mutex<u64>,
}

impl PmemPool {
    /// Open the pool for `(team_id, unit, pool_id)`. `PMEM_FILE_CREATE`
    /// creates a missing pool; adding `PMEM_FILE_EXCL` fails if it already
    /// exists. `mode` sets the file permissions on creation (unix).
    pub fn open(team_id: u32, unit: usize, pool_id: &str, flags: u32, mode: u32) -> Result<PmemPool> {
        let dir = PathBuf::from(&config().pmem_dir);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Transport(format!("pmem dir {:?}: {}", dir, e)))?;
        let path = dir.join(format!("team{}_unit{}_{}.pool", team_id, unit, pool_id));

        let exists = path.exists();
        if exists && flags & PMEM_FILE_EXCL != 0 {
            return Err(Error::Invalid(format!("pool {:?} already exists", path)));
        }
        if !exists && flags & PMEM_FILE_CREATE == 0 {
            return Err(Error::NotFound(format!("pool {:?}", path)));
        }

        let pool = if exists {
            let mut pool = PmemPool {
                path,
                buckets: Mutex::new(Vec::new()),
                next_oid: Mutex::new(1),
            };
            pool.load()?;
            pool
        } else {
            let pool = PmemPool {
                path,
                buckets: Mutex::new(Vec::new()),
                next_oid: Mutex::new(1),
            };
            pool.write_through()?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&pool.path, fs::Permissions::from_mode(mode));
            }
            #[cfg(not(unix))]
            let _ = mode;
            pool
        };
        debug!(path = ?pool.path, existed = exists, "pmem pool opened");
        Ok(pool)
    }

    fn load(&mut self) -> Result<()> {
        let mut file = fs::File::open(&self.path)
            .map_err(|e| Error::Transport(format!("open {:?}: {}", self.path, e)))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::Transport(format!("read {:?}: {}", self.path, e)))?;

        let truncated = || Error::Invalid(format!("truncated pool file {:?}", self.path));
        let mut cursor = 0usize;
        if read_u64(&bytes, &mut cursor).ok_or_else(truncated)? != POOL_MAGIC {
            return Err(Error::Invalid(format!("{:?} is not a pool file", self.path)));
        }
        let count = read_u64(&bytes, &mut cursor).ok_or_else(truncated)? as usize;
        let mut buckets = Vec::with_capacity(count);
        let mut max_oid = 0u64;
        for _ in 0..count {
            let oid = read_u64(&bytes, &mut cursor).ok_or_else(truncated)?;
            let nbytes = read_u64(&bytes, &mut cursor).ok_or_else(truncated)? as usize;
            let end = cursor + nbytes;
            let data = bytes
                .get(cursor..end)
                .ok_or_else(truncated)?
                .to_vec()
                .into_boxed_slice();
            cursor = end;
            max_oid = max_oid.max(oid);
            buckets.push(Bucket { oid, data });
        }
        *self.buckets.lock() = buckets;
        *self.next_oid.lock() = max_oid + 1;
        Ok(())
    }

    fn write_through(&self) -> Result<()> {
        let buckets = self.buckets.lock();
        let mut out = Vec::new();
        out.extend_from_slice(&POOL_MAGIC.to_le_bytes());
        out.extend_from_slice(&(buckets.len() as u64).to_le_bytes());
        for bucket in buckets.iter() {
            out.extend_from_slice(&bucket.oid.to_le_bytes());
            out.extend_from_slice(&(bucket.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&bucket.data);
        }
        drop(buckets);
        let mut file = fs::File::create(&self.path)
            .map_err(|e| Error::Transport(format!("create {:?}: {}", self.path, e)))?;
        file.write_all(&out)
            .map_err(|e| Error::Transport(format!("write {:?}: {}", self.path, e)))?;
        file.sync_all()
            .map_err(|e| Error::Transport(format!("sync {:?}: {}", self.path, e)))?;
        Ok(())
    }

    /// Allocate a zeroed bucket of `nbytes`.
    pub fn alloc(&self, nbytes: usize) -> Oid {
        let mut next = self.next_oid.lock();
        let oid = *next;
        *next += 1;
        drop(next);
        self.buckets.lock().push(Bucket {
            oid,
            data: vec![0u8; nbytes].into_boxed_slice(),
        });
        Oid(oid)
    }

    /// Native address of a bucket's bytes. Stable for the bucket's lifetime.
    pub fn getaddr(&self, oid: Oid) -> Result<*mut u8> {
        let mut buckets = self.buckets.lock();
        buckets
            .iter_mut()
            .find(|b| b.oid == oid.0)
            .map(|b| b.data.as_mut_ptr())
            .ok_or_else(|| Error::NotFound(format!("bucket {}", oid.0)))
    }

    pub fn oid_size(&self, oid: Oid) -> Result<usize> {
        self.buckets
            .lock()
            .iter()
            .find(|b| b.oid == oid.0)
            .map(|b| b.data.len())
            .ok_or_else(|| Error::NotFound(format!("bucket {}", oid.0)))
    }

    pub fn pool_stat(&self) -> PoolStat {
        PoolStat {
            num_buckets: self.buckets.lock().len(),
        }
    }

    /// Every bucket id currently in the pool, in allocation order.
    pub fn fetch_all(&self) -> Vec<Oid> {
        self.buckets.lock().iter().map(|b| Oid(b.oid)).collect()
    }

    /// Remove a bucket from the pool; its bytes vanish at the next persist.
    pub fn free(&self, oid: Oid) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let index = buckets
            .iter()
            .position(|b| b.oid == oid.0)
            .ok_or_else(|| Error::NotFound(format!("bucket {}", oid.0)))?;
        buckets.remove(index);
        Ok(())
    }

    /// Flush the range `[ptr, ptr + nbytes)` to stable storage. The range
    /// must lie within one bucket.
    pub fn persist(&self, ptr: *const u8, nbytes: usize) -> Result<()> {
        let addr = ptr as usize;
        let contained = self.buckets.lock().iter().any(|b| {
            let base = b.data.as_ptr() as usize;
            base <= addr && addr + nbytes <= base + b.data.len()
        });
        if !contained {
            return Err(Error::Invalid(format!(
                "persist range {:#x}+{} is not pool memory",
                addr, nbytes
            )));
        }
        self.write_through()
    }

    /// Persist everything and close the pool.
    pub fn close(self) -> Result<()> {
        self.write_through()
    }
}

struct PmemBucketInfo {
    lptr: usize,
    oid: Oid,
    nbytes: usize,
    gptr: GlobalPtr,
}

/// Allocation strategy for persistent global memory across a team: local
/// buckets from a per-unit pool, attached to the team's global address
/// space on demand, and recoverable across pool reopens.
pub struct PmemAllocator<T: Remote> {
    team_id: u32,
    pool_id: String,
    nunits: usize,
    pool: PmemPool,
    allocated: Mutex<Vec<PmemBucketInfo>>,
    _marker: PhantomData<T>,
}

impl<T: Remote + 'static> PmemAllocator<T> {
    /// Exclusively create the backing pool for `team_id`.
    pub fn create(rt: &Runtime, team_id: u32, pool_id: &str) -> Result<PmemAllocator<T>> {
        let nunits = rt.team_size(team_id)?;
        let me = rt.team_myid(team_id)?;
        let pool = PmemPool::open(
            team_id,
            me,
            pool_id,
            PMEM_FILE_CREATE | PMEM_FILE_EXCL,
            0o700,
        )?;
        Ok(PmemAllocator {
            team_id,
            pool_id: pool_id.to_owned(),
            nunits,
            pool,
            allocated: Mutex::new(Vec::new()),
            _marker: PhantomData,
        })
    }

    /// Open (or create) the backing pool and rebuild the bucket list from
    /// its contents.
    pub fn open(rt: &Runtime, team_id: u32, pool_id: &str) -> Result<PmemAllocator<T>> {
        let nunits = rt.team_size(team_id)?;
        let me = rt.team_myid(team_id)?;
        let pool = PmemPool::open(team_id, me, pool_id, PMEM_FILE_CREATE, 0o700)?;
        let alloc = PmemAllocator {
            team_id,
            pool_id: pool_id.to_owned(),
            nunits,
            pool,
            allocated: Mutex::new(Vec::new()),
            _marker: PhantomData,
        };
        alloc.relocate_pmem_buckets()?;
        Ok(alloc)
    }

    /// Rebuild the bucket list after a reopen: fetch every object id, then
    /// rematerialize local pointers and sizes.
    fn relocate_pmem_buckets(&self) -> Result<()> {
        let stat = self.pool.pool_stat();
        if stat.num_buckets == 0 {
            return Ok(());
        }
        let mut allocated = self.allocated.lock();
        for oid in self.pool.fetch_all() {
            let lptr = self.pool.getaddr(oid)? as usize;
            let nbytes = self.pool.oid_size(oid)?;
            debug!(oid = oid.0, nbytes, "relocated bucket");
            allocated.push(PmemBucketInfo {
                lptr,
                oid,
                nbytes,
                gptr: GPTR_NULL,
            });
        }
        Ok(())
    }

    /// Allocate `n` persistent elements locally. Local operation; counts may
    /// differ between units.
    pub fn allocate_local(&self, n: usize) -> Result<*mut T> {
        let nbytes = n * std::mem::size_of::<T>();
        let oid = self.pool.alloc(nbytes);
        let lptr = self.pool.getaddr(oid)?;
        self.allocated.lock().push(PmemBucketInfo {
            lptr: lptr as usize,
            oid,
            nbytes,
            gptr: GPTR_NULL,
        });
        debug!(nbytes, oid = oid.0, "pmem local alloc");
        Ok(lptr as *mut T)
    }

    /// Register a locally allocated bucket in global memory space.
    /// Collective over the team.
    pub fn attach(&self, rt: &Runtime, lptr: *mut T, n: usize) -> Result<GlobalPtr> {
        let nbytes = n * std::mem::size_of::<T>();
        let mut allocated = self.allocated.lock();
        let bucket = allocated
            .iter_mut()
            .find(|b| b.lptr == lptr as usize)
            .ok_or_else(|| {
                Error::Invalid("pointer was never allocated in persistent memory".into())
            })?;
        let gptr = rt.team_memregister(self.team_id, lptr as *mut u8, nbytes)?;
        bucket.gptr = gptr;
        Ok(gptr)
    }

    /// Deregister a bucket from global memory space and persist its bytes.
    /// Does not release the local memory. Collective over the team.
    pub fn detach(&self, rt: &Runtime, gptr: GlobalPtr) -> Result<()> {
        self.detach_bucket_by_gptr(rt, gptr, false)
    }

    /// Allocate locally and attach in one step. Collective over the team.
    pub fn allocate(&self, rt: &Runtime, n: usize) -> Result<GlobalPtr> {
        let lptr = self.allocate_local(n)?;
        self.attach(rt, lptr, n)
    }

    /// Detach and release a bucket. Collective over the team.
    pub fn deallocate(&self, rt: &Runtime, gptr: GlobalPtr) -> Result<()> {
        self.detach_bucket_by_gptr(rt, gptr, true)
    }

    fn detach_bucket_by_gptr(&self, rt: &Runtime, gptr: GlobalPtr, deallocate: bool) -> Result<()> {
        if rt.is_finalized() {
            warn!(%gptr, "pmem detach after finalize ignored");
            return Ok(());
        }
        let mut allocated = self.allocated.lock();
        let index = allocated
            .iter()
            .position(|b| b.gptr == gptr)
            .ok_or_else(|| Error::NotFound(format!("no bucket attached as {}", gptr)))?;
        rt.team_memderegister(self.team_id, gptr)?;
        let bucket = allocated.remove(index);
        drop(allocated);
        self.pool.persist(bucket.lptr as *const u8, bucket.nbytes)?;
        if deallocate {
            self.pool.free(bucket.oid)?;
        }
        Ok(())
    }

    /// Local pointers and element counts of every tracked bucket.
    pub fn local_buckets(&self) -> Vec<(*mut T, usize)> {
        self.allocated
            .lock()
            .iter()
            .map(|b| (b.lptr as *mut T, b.nbytes / std::mem::size_of::<T>()))
            .collect()
    }

    pub fn team(&self) -> u32 {
        self.team_id
    }

    /// A copy of this allocator cannot replay the physical pool handle.
    pub fn try_clone(&self) -> Result<PmemAllocator<T>> {
        Err(Error::NotImplemented(
            "copying a persistent allocator cannot replay the pool handle",
        ))
    }

    /// Persist everything and close the backing pool.
    pub fn close(self) -> Result<()> {
        self.pool.close()
    }
}

impl<T: Remote + 'static, U: Remote + 'static> PartialEq<PmemAllocator<U>> for PmemAllocator<T> {
    fn eq(&self, other: &PmemAllocator<U>) -> bool {
        std::mem::size_of::<T>() == std::mem::size_of::<U>()
            && self.team_id == other.team_id
            && self.pool_id == other.pool_id
            && self.nunits == other.nunits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeBuilder;
    use crate::team::TEAM_ALL;
    use crate::transport::Backend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static UNIQ: AtomicUsize = AtomicUsize::new(0);

    fn unique_pool_id(tag: &str) -> String {
        format!(
            "{}_{}_{}",
            tag,
            std::process::id(),
            UNIQ.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn local_runtime() -> Runtime {
        RuntimeBuilder::new()
            .with_backend(Backend::Local)
            .build()
            .unwrap()
    }

    #[test]
    fn pool_bucket_roundtrip() {
        let pool_id = unique_pool_id("roundtrip");
        let pool = PmemPool::open(0, 0, &pool_id, PMEM_FILE_CREATE, 0o700).unwrap();
        let oid = pool.alloc(16);
        let addr = pool.getaddr(oid).unwrap();
        unsafe {
            std::slice::from_raw_parts_mut(addr, 16).copy_from_slice(&[7u8; 16]);
        }
        pool.persist(addr, 16).unwrap();
        pool.close().unwrap();

        let pool = PmemPool::open(0, 0, &pool_id, 0, 0o700).unwrap();
        assert_eq!(pool.pool_stat().num_buckets, 1);
        let oids = pool.fetch_all();
        assert_eq!(oids.len(), 1);
        assert_eq!(pool.oid_size(oids[0]).unwrap(), 16);
        let addr = pool.getaddr(oids[0]).unwrap();
        assert_eq!(unsafe { std::slice::from_raw_parts(addr, 16) }, &[7u8; 16]);
    }

    #[test]
    fn excl_create_fails_on_existing() {
        let pool_id = unique_pool_id("excl");
        let pool =
            PmemPool::open(0, 0, &pool_id, PMEM_FILE_CREATE | PMEM_FILE_EXCL, 0o700).unwrap();
        pool.close().unwrap();
        assert!(matches!(
            PmemPool::open(0, 0, &pool_id, PMEM_FILE_CREATE | PMEM_FILE_EXCL, 0o700),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn missing_pool_without_create() {
        let pool_id = unique_pool_id("missing");
        assert!(matches!(
            PmemPool::open(0, 0, &pool_id, 0, 0o700),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn allocator_attach_detach_relocate() {
        let rt = local_runtime();
        let pool_id = unique_pool_id("alloc");
        {
            let alloc: PmemAllocator<u64> = PmemAllocator::create(&rt, TEAM_ALL, &pool_id).unwrap();
            let lptr = alloc.allocate_local(8).unwrap();
            unsafe {
                std::slice::from_raw_parts_mut(lptr, 8).copy_from_slice(&[3u64; 8]);
            }
            let gptr = alloc.attach(&rt, lptr, 8).unwrap();
            assert!(!gptr.is_null());
            assert!(gptr.seg_id < 0);
            alloc.detach(&rt, gptr).unwrap();
            alloc.close().unwrap();
        }
        // reopen relocates the persisted bucket
        let alloc: PmemAllocator<u64> = PmemAllocator::open(&rt, TEAM_ALL, &pool_id).unwrap();
        let buckets = alloc.local_buckets();
        assert_eq!(buckets.len(), 1);
        let (lptr, n) = buckets[0];
        assert_eq!(n, 8);
        assert_eq!(unsafe { std::slice::from_raw_parts(lptr, 8) }, &[3u64; 8]);
    }

    #[test]
    fn attach_unknown_pointer_is_invalid() {
        let rt = local_runtime();
        let pool_id = unique_pool_id("unknown");
        let alloc: PmemAllocator<u32> = PmemAllocator::create(&rt, TEAM_ALL, &pool_id).unwrap();
        let mut stray = 0u32;
        assert!(matches!(
            alloc.attach(&rt, &mut stray as *mut u32, 1),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn allocator_equality_and_clone() {
        let rt = local_runtime();
        let pool_id = unique_pool_id("eq");
        let a: PmemAllocator<u64> = PmemAllocator::create(&rt, TEAM_ALL, &pool_id).unwrap();
        let b: PmemAllocator<i64> = PmemAllocator::open(&rt, TEAM_ALL, &pool_id).unwrap();
        assert!(a == b);
        assert!(matches!(a.try_clone(), Err(Error::NotImplemented(_))));
    }
}
