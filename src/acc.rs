//! Accumulator: a process-shared, single-producer/single-consumer ring
//! buffer over an mmap'd file, used as the hot ingest path in front of the
//! store's write machinery.
//!
//! The header carries two atomic cursors (`read`, `write`) that only ever
//! grow; `index = cursor % capacity` locates a slot. Ingest publishes with
//! release ordering; drain loads with acquire ordering, so a row observed
//! by drain was written by an ingest call that happens-before it.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::rowset::RowSet;
use crate::store::Store;

const MAGIC: u32 = 0x4343_4152;
const VERSION: u32 = 1;
const MIN_CAPACITY: u64 = 32;
const ROW_SIZE: usize = 16;
const HEADER_SIZE: usize = 32;

mod header_offset {
	pub const MAGIC: usize = 0;
	pub const VERSION: usize = 4;
	pub const CAPACITY: usize = 8;
	pub const READ: usize = 16;
	pub const WRITE: usize = 24;
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
	u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
	u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
	buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, val: u64) {
	buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

/// Outcome of a single [`Accumulator::drain`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
	/// Rows written to the drained store file (zero if nothing was pending).
	pub rows: u64,
	/// Rows the producer overwrote before the consumer could read them.
	pub lost: u64,
}

/// A single-producer/single-consumer ring buffer backed by a memory-mapped
/// file named `acc` inside a data directory.
pub struct Accumulator {
	path: PathBuf,
	mmap: MmapMut,
	capacity: u64,
}

impl Accumulator {
	/// Opens (creating if absent) the accumulator file under `dir`.
	/// `capacity` is a minimum; it is doubled to leave slack between
	/// producer and consumer, and raised to at least 32. Reopening an
	/// existing file uses its stored capacity, ignoring the argument.
	pub fn open(dir: impl AsRef<Path>, capacity: u64) -> Result<Accumulator> {
		let dir = dir.as_ref();
		std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
		let path = dir.join("acc");
		let capacity = capacity.max(MIN_CAPACITY) * 2;

		match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
			Ok(file) => Self::init_new(file, path, capacity),
			Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Self::open_existing(path),
			Err(e) => Err(Error::io(&path, e)),
		}
	}

	fn init_new(file: File, path: PathBuf, capacity: u64) -> Result<Accumulator> {
		let len = HEADER_SIZE as u64 + capacity * ROW_SIZE as u64;
		file.set_len(len).map_err(|e| Error::io(&path, e))?;
		let mut mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::io(&path, e))?;
		put_u32(&mut mmap, header_offset::MAGIC, MAGIC);
		put_u32(&mut mmap, header_offset::VERSION, VERSION);
		put_u64(&mut mmap, header_offset::CAPACITY, capacity);
		Ok(Accumulator { path, mmap, capacity })
	}

	fn open_existing(path: PathBuf) -> Result<Accumulator> {
		let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| Error::io(&path, e))?;
		let len = file.metadata().map_err(|e| Error::io(&path, e))?.len() as usize;
		if len < HEADER_SIZE {
			return Err(Error::Corruption(format!("'{}' is smaller than the accumulator header", path.display())));
		}
		let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::io(&path, e))?;

		let magic = get_u32(&mmap, header_offset::MAGIC);
		if magic != MAGIC {
			return Err(Error::Corruption(format!("invalid accumulator magic 0x{:x} for '{}'", magic, path.display())));
		}
		let version = get_u32(&mmap, header_offset::VERSION);
		if version != VERSION {
			return Err(Error::UnsupportedVersion(version));
		}
		let capacity = get_u64(&mmap, header_offset::CAPACITY);

		Ok(Accumulator { path, mmap, capacity })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn capacity(&self) -> u64 {
		self.capacity
	}

	fn read_cursor(&self) -> &AtomicU64 {
		unsafe { &*(self.mmap.as_ptr().add(header_offset::READ) as *const AtomicU64) }
	}

	fn write_cursor(&self) -> &AtomicU64 {
		unsafe { &*(self.mmap.as_ptr().add(header_offset::WRITE) as *const AtomicU64) }
	}

	// Single-producer/single-consumer contract: only `ingest` ever writes a
	// slot before publishing `write`, and only `drain` ever reads a slot
	// after loading `write`, so a plain (non-atomic) read/write through a
	// pointer derived from the shared mapping is race-free as long as
	// callers respect "one producer, one consumer".
	fn row_ptr(&self, index: usize) -> *mut u8 {
		let offset = HEADER_SIZE + index * ROW_SIZE;
		unsafe { (self.mmap.as_ptr() as *mut u8).add(offset) }
	}

	fn write_row(&self, index: usize, a: u64, b: u64) {
		let ptr = self.row_ptr(index);
		unsafe {
			*(ptr as *mut u64) = a;
			*(ptr.add(8) as *mut u64) = b;
		}
	}

	fn read_row(&self, index: usize) -> (u64, u64) {
		let ptr = self.row_ptr(index);
		unsafe { (*(ptr as *const u64), *(ptr.add(8) as *const u64)) }
	}

	/// Producer side: appends `(a, b)`. Wait-free; never blocks on the
	/// consumer. Both sides must be nonzero.
	pub fn ingest(&self, a: u64, b: u64) -> Result<()> {
		if a == 0 || b == 0 {
			return Err(Error::InvalidArgument(format!("row ({}, {}) has a zero side", a, b)));
		}

		let write = self.write_cursor().load(Ordering::Relaxed);
		let index = (write % self.capacity) as usize;
		self.write_row(index, a, b);
		self.write_cursor().store(write + 1, Ordering::Release);
		Ok(())
	}

	/// Consumer side: copies every row ingested since the last drain into a
	/// new store file at `path` with timestamp `ts` and quantum `0`, then
	/// publishes the new read cursor. A no-op (zero rows, zero losses) if
	/// nothing is pending. If the producer lapped the ring since the last
	/// drain, the overwritten entries are reported as lost rather than
	/// silently skipped.
	pub fn drain(&self, path: impl AsRef<Path>, ts: u64) -> Result<DrainReport> {
		let start = self.read_cursor().load(Ordering::Acquire);
		let end = self.write_cursor().load(Ordering::Acquire);
		if start == end {
			return Ok(DrainReport { rows: 0, lost: 0 });
		}

		let mut lost = 0u64;
		let mut start = start;
		if end - start > self.capacity {
			lost = (end - start) - self.capacity;
			log::warn!(
				target: "pairdb",
				"accumulator '{}' lost {} events (read={}, write={}, capacity={})",
				self.path.display(), lost, start, end, self.capacity,
			);
			start = end - self.capacity;
		}

		let mut rows = RowSet::with_capacity((end - start) as usize);
		for i in start..end {
			let index = (i % self.capacity) as usize;
			let (a, b) = self.read_row(index);
			rows.push(a, b)?;
		}

		Store::write(path, ts, 0, &mut rows)?;
		self.read_cursor().store(end, Ordering::Release);

		Ok(DrainReport { rows: end - start, lost })
	}
}
