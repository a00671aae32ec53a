//! On-disk store: a single immutable, memory-mapped file holding a
//! compressed, doubly-indexed representation of a sorted pair-set.
//!
//! File layout (all integers little-endian): fixed header, index for column
//! A, index for column B, encoded data for column A (sorted by `(a, b)`),
//! encoded data for column B (sorted by `(b, a)`). See `DESIGN.md` for why
//! the column index doubles as the opposite column's value dictionary.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};

use crate::codec::{capacity_bound, Decoder, Encoder};
use crate::dict::Dict;
use crate::error::{Error, Result};
use crate::index::{self, IndexBuilder, IndexView};
use crate::rowset::{Row, RowSet};

pub const MAGIC: u32 = 0x4C4C_4952;
pub const VERSION: u32 = 6;
pub const STAMP: u64 = 0xFFFF_FFFF_FFFF_FFFF;
/// Store versions this build can open. A deployment that needs to read an
/// older on-disk format extends this slice; no decoder for version < 6
/// ships in this crate (see DESIGN.md's Open Question decisions).
pub const SUPPORTED_VERSIONS: &[u32] = &[6];

pub const HEADER_SIZE: usize = 88;

mod header_offset {
	pub const MAGIC: usize = 0;
	pub const VERSION: usize = 4;
	pub const TS: usize = 8;
	pub const QUANT: usize = 16;
	pub const ROWS: usize = 24;
	pub const DATA_A_OFF: usize = 32;
	pub const DATA_B_OFF: usize = 40;
	pub const INDEX_A_OFF: usize = 48;
	pub const INDEX_B_OFF: usize = 56;
	// 16 reserved bytes at 64..80
	pub const STAMP: usize = 80;
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

/// Which side of a pair a region/index belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
	A,
	B,
}

impl Column {
	pub fn other(self) -> Column {
		match self {
			Column::A => Column::B,
			Column::B => Column::A,
		}
	}
}

/// An immutable, memory-mapped store file.
pub struct Store {
	path: PathBuf,
	mmap: Mmap,
}

impl Store {
	/// Opens and validates an existing store file: stats it, mmaps it
	/// read-only, and checks magic, version, and durability stamp. Readers
	/// must refuse files whose stamp is missing — a crashed writer's
	/// partial file looks exactly like this and is rejected the same way.
	pub fn open(path: impl AsRef<Path>) -> Result<Store> {
		let path = path.as_ref().to_path_buf();
		let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
		let len = file.metadata().map_err(|e| Error::io(&path, e))?.len() as usize;
		if len < HEADER_SIZE {
			return Err(Error::Corruption(format!("'{}' is smaller than the header", path.display())));
		}

		let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(&path, e))?;
		let store = Store { path, mmap };
		store.validate()?;
		Ok(store)
	}

	fn validate(&self) -> Result<()> {
		let magic = get_u32(&self.mmap, header_offset::MAGIC);
		if magic != MAGIC {
			return Err(Error::Corruption(format!(
				"invalid magic 0x{:x} for '{}'", magic, self.path.display()
			)));
		}

		let version = get_u32(&self.mmap, header_offset::VERSION);
		if !SUPPORTED_VERSIONS.contains(&version) {
			return Err(Error::UnsupportedVersion(version));
		}

		let stamp = get_u64(&self.mmap, header_offset::STAMP);
		if stamp != STAMP {
			return Err(Error::Corruption(format!(
				"missing durability stamp for '{}'", self.path.display()
			)));
		}

		let index_a_off = self.index_a_off();
		let index_b_off = self.index_b_off();
		let data_a_off = self.data_a_off();
		let data_b_off = self.data_b_off();
		if !(HEADER_SIZE <= index_a_off
			&& index_a_off <= index_b_off
			&& index_b_off <= data_a_off
			&& data_a_off <= data_b_off
			&& data_b_off <= self.mmap.len())
		{
			return Err(Error::Corruption(format!(
				"region offsets out of order or out of bounds in '{}'", self.path.display()
			)));
		}

		// Validate that both index regions actually parse before trusting
		// anything fetched through them later.
		IndexView::parse(&self.mmap[index_a_off..index_b_off])?;
		IndexView::parse(&self.mmap[index_b_off..data_a_off])?;

		Ok(())
	}

	fn index_a_off(&self) -> usize {
		get_u64(&self.mmap, header_offset::INDEX_A_OFF) as usize
	}
	fn index_b_off(&self) -> usize {
		get_u64(&self.mmap, header_offset::INDEX_B_OFF) as usize
	}
	fn data_a_off(&self) -> usize {
		get_u64(&self.mmap, header_offset::DATA_A_OFF) as usize
	}
	fn data_b_off(&self) -> usize {
		get_u64(&self.mmap, header_offset::DATA_B_OFF) as usize
	}

	pub fn file(&self) -> &Path {
		&self.path
	}

	pub fn version(&self) -> u32 {
		get_u32(&self.mmap, header_offset::VERSION)
	}

	pub fn ts(&self) -> u64 {
		get_u64(&self.mmap, header_offset::TS)
	}

	pub fn quant(&self) -> u64 {
		get_u64(&self.mmap, header_offset::QUANT)
	}

	pub fn rows(&self) -> u64 {
		get_u64(&self.mmap, header_offset::ROWS)
	}

	fn index_region(&self, col: Column) -> (usize, usize) {
		match col {
			Column::A => (self.index_a_off(), self.index_b_off()),
			Column::B => (self.index_b_off(), self.data_a_off()),
		}
	}

	fn index_view(&self, col: Column) -> Result<IndexView<'_>> {
		let (start, end) = self.index_region(col);
		IndexView::parse(&self.mmap[start..end])
	}

	fn data_slice(&self, col: Column) -> &[u8] {
		match col {
			Column::A => &self.mmap[self.data_a_off()..self.data_b_off()],
			Column::B => &self.mmap[self.data_b_off()..],
		}
	}

	/// Number of distinct values in `col`'s index.
	pub fn value_count(&self, col: Column) -> Result<usize> {
		Ok(self.index_view(col)?.len())
	}

	/// Copies up to `out.len()` distinct values of `col` into `out`,
	/// returning how many were written.
	pub fn values(&self, col: Column, out: &mut [u64]) -> Result<usize> {
		let view = self.index_view(col)?;
		let len = out.len().min(view.len());
		for (i, slot) in out.iter_mut().take(len).enumerate() {
			*slot = view.key_at(i).unwrap();
		}
		Ok(len)
	}

	/// Advises the kernel this store will be scanned soon.
	pub fn advise_will_need(&self) {
		self.madvise(libc::MADV_WILLNEED);
	}

	/// Advises the kernel this store's pages can be dropped.
	pub fn advise_dont_need(&self) {
		self.madvise(libc::MADV_DONTNEED);
	}

	fn madvise(&self, advice: libc::c_int) {
		let ptr = self.mmap.as_ptr() as *mut libc::c_void;
		let ret = unsafe { libc::madvise(ptr, self.mmap.len(), advice) };
		if ret != 0 {
			log::warn!(target: "pairdb", "madvise({:?}) failed for '{}'", advice, self.path.display());
		}
	}

	/// A decoder positioned at the start of `col`'s data, in that column's
	/// natural orientation (column B yields `(b, a)` pairs, not `(a, b)` —
	/// see the block codec docs).
	pub fn iterate(&self, col: Column) -> Result<Decoder<'_>> {
		let own = self.index_view(col)?;
		let value_index = self.index_view(col.other())?;
		Ok(Decoder::new(self.data_slice(col), own, value_index))
	}

	/// Appends every row whose `col` side equals `key` to `out`, in
	/// original `(a, b)` orientation. A missing key is success with zero
	/// rows appended.
	pub fn query(&self, col: Column, key: u64, out: &mut RowSet) -> Result<()> {
		let own = self.index_view(col)?;
		let value_index = self.index_view(col.other())?;

		let (ordinal, offset) = match own.find(key) {
			Some(hit) => hit,
			None => return Ok(()),
		};

		let data = &self.data_slice(col)[offset as usize..];
		let mut decoder = Decoder::at(data, own, value_index, ordinal);

		loop {
			let row = decoder.next()?;
			if row.is_nil() || row.a != key {
				break;
			}
			let emit = match col {
				Column::A => row,
				Column::B => row.inverted(),
			};
			out.push_row(emit);
		}

		Ok(())
	}

	/// Writes `rows` (sorted and compacted in place) to a new store file at
	/// `path`. A no-op if `rows` is empty. On any failure the partial file
	/// is unlinked.
	pub fn write(path: impl AsRef<Path>, ts: u64, quant: u64, rows: &mut RowSet) -> Result<()> {
		rows.compact();
		if rows.is_empty() {
			return Ok(());
		}

		let dict_b = Dict::from_values(rows.as_slice().iter().map(|r| r.b).collect());
		let dict_a = Dict::from_values(rows.as_slice().iter().map(|r| r.a).collect());

		let path = path.as_ref();
		let build = || -> Result<()> {
			let index_a_cap = index::capacity_for(dict_a.len());
			let index_b_cap = index::capacity_for(dict_b.len());
			let data_a_cap = capacity_bound(&dict_b, rows.len());
			let data_b_cap = capacity_bound(&dict_a, rows.len());
			let total_cap = HEADER_SIZE + index_a_cap + index_b_cap + data_a_cap + data_b_cap;

			let (file, mut mmap) = create_mapped(path, total_cap)?;

			let index_a_off = HEADER_SIZE;
			let index_b_off = index_a_off + index_a_cap;
			let data_a_off = index_b_off + index_b_cap;

			put_u32(&mut mmap, header_offset::MAGIC, MAGIC);
			put_u32(&mut mmap, header_offset::VERSION, VERSION);
			put_u64(&mut mmap, header_offset::TS, ts);
			put_u64(&mut mmap, header_offset::QUANT, quant);
			put_u64(&mut mmap, header_offset::INDEX_A_OFF, index_a_off as u64);
			put_u64(&mut mmap, header_offset::INDEX_B_OFF, index_b_off as u64);
			put_u64(&mut mmap, header_offset::DATA_A_OFF, data_a_off as u64);

			let mut index_a = IndexBuilder::new();
			let a_rows = rows.as_slice().iter().copied().map(Ok);
			let encoded_a =
				encode_column(&mut mmap[data_a_off..data_a_off + data_a_cap], &mut index_a, &dict_b, a_rows)?;
			index_a.write_into(&mut mmap[index_a_off..index_b_off])?;

			let data_b_off = data_a_off + encoded_a.len;
			put_u64(&mut mmap, header_offset::DATA_B_OFF, data_b_off as u64);

			rows.invert();
			rows.compact();

			let mut index_b = IndexBuilder::new();
			let b_rows = rows.as_slice().iter().copied().map(Ok);
			let encoded_b =
				encode_column(&mut mmap[data_b_off..data_b_off + data_b_cap], &mut index_b, &dict_a, b_rows)?;
			index_b.write_into(&mut mmap[index_b_off..data_a_off])?;

			put_u64(&mut mmap, header_offset::ROWS, encoded_a.rows);

			let final_len = data_b_off + encoded_b.len;
			finalize(&file, &mut mmap, final_len)?;
			Ok(())
		};

		if let Err(e) = build() {
			let _ = std::fs::remove_file(path);
			return Err(e);
		}
		Ok(())
	}

	/// Merges `stores` (which must cover the same logical quantum) into a
	/// new store at `path`, producing `compact(union(rows(stores)))`.
	pub fn merge(stores: &[&Store], path: impl AsRef<Path>, ts: u64, quant: u64) -> Result<()> {
		if stores.len() < 2 {
			return Err(Error::InvalidArgument("merge requires at least two stores".into()));
		}

		let mut a_values = Vec::new();
		let mut b_values = Vec::new();
		let mut rows_bound: usize = 0;
		for store in stores {
			store.advise_will_need();
			a_values.extend(store.index_view(Column::A)?.keys());
			b_values.extend(store.index_view(Column::B)?.keys());
			rows_bound += store.rows() as usize;
		}
		let dict_a = Dict::from_values(a_values);
		let dict_b = Dict::from_values(b_values);

		let path = path.as_ref();
		let build = || -> Result<()> {
			let index_a_cap = index::capacity_for(dict_a.len());
			let index_b_cap = index::capacity_for(dict_b.len());
			let data_a_cap = capacity_bound(&dict_b, rows_bound);
			let data_b_cap = capacity_bound(&dict_a, rows_bound);
			let total_cap = HEADER_SIZE + index_a_cap + index_b_cap + data_a_cap + data_b_cap;

			let (file, mut mmap) = create_mapped(path, total_cap)?;

			let index_a_off = HEADER_SIZE;
			let index_b_off = index_a_off + index_a_cap;
			let data_a_off = index_b_off + index_b_cap;

			put_u32(&mut mmap, header_offset::MAGIC, MAGIC);
			put_u32(&mut mmap, header_offset::VERSION, VERSION);
			put_u64(&mut mmap, header_offset::TS, ts);
			put_u64(&mut mmap, header_offset::QUANT, quant);
			put_u64(&mut mmap, header_offset::INDEX_A_OFF, index_a_off as u64);
			put_u64(&mut mmap, header_offset::INDEX_B_OFF, index_b_off as u64);
			put_u64(&mut mmap, header_offset::DATA_A_OFF, data_a_off as u64);

			let mut index_a = IndexBuilder::new();
			let decoders_a = stores.iter().map(|s| s.iterate(Column::A)).collect::<Result<Vec<_>>>()?;
			let merged_a = KWayMerge::new(decoders_a)?;
			let encoded_a =
				encode_column(&mut mmap[data_a_off..data_a_off + data_a_cap], &mut index_a, &dict_b, merged_a)?;
			index_a.write_into(&mut mmap[index_a_off..index_b_off])?;

			let data_b_off = data_a_off + encoded_a.len;
			put_u64(&mut mmap, header_offset::DATA_B_OFF, data_b_off as u64);

			let mut index_b = IndexBuilder::new();
			let decoders_b = stores.iter().map(|s| s.iterate(Column::B)).collect::<Result<Vec<_>>>()?;
			let merged_b = KWayMerge::new(decoders_b)?;
			let encoded_b =
				encode_column(&mut mmap[data_b_off..data_b_off + data_b_cap], &mut index_b, &dict_a, merged_b)?;
			index_b.write_into(&mut mmap[index_b_off..data_a_off])?;

			put_u64(&mut mmap, header_offset::ROWS, encoded_a.rows);

			let final_len = data_b_off + encoded_b.len;
			finalize(&file, &mut mmap, final_len)?;
			Ok(())
		};

		let result = build();

		for store in stores {
			store.advise_dont_need();
		}

		if let Err(e) = result {
			let _ = std::fs::remove_file(path);
			return Err(e);
		}
		Ok(())
	}

	/// Unlinks this store's backing file.
	pub fn remove(self) -> Result<()> {
		std::fs::remove_file(&self.path).map_err(|e| Error::io(&self.path, e))
	}
}

/// Opens every `*.rill` file directly under `dir` as a [`Store`], skipping
/// (with a logged warning) any that fails to open — a missing directory is
/// an empty result, not an error, matching the behavior callers need at
/// first startup before anything has ever been written.
pub fn scan_dir(dir: &Path) -> Result<Vec<Store>> {
	let entries = match std::fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(Error::io(dir, e)),
	};

	let mut stores = Vec::new();
	for entry in entries {
		let entry = entry.map_err(|e| Error::io(dir, e))?;
		let path = entry.path();
		if path.extension().and_then(|e| e.to_str()) != Some("rill") {
			continue;
		}

		match Store::open(&path) {
			Ok(store) => stores.push(store),
			Err(e) => log::warn!(target: "pairdb", "skipping '{}': {}", path.display(), e),
		}
	}

	Ok(stores)
}

struct EncodedColumn {
	len: usize,
	rows: u64,
}

fn encode_column(
	region: &mut [u8],
	index: &mut IndexBuilder,
	dict: &Dict,
	source: impl Iterator<Item = Result<Row>>,
) -> Result<EncodedColumn> {
	let mut encoder = Encoder::new(region, index, dict);
	for row in source {
		let row = row?;
		encoder.encode(row.a, row.b)?;
	}
	let encoded = encoder.finish()?;
	Ok(EncodedColumn { len: encoded.len, rows: encoded.rows })
}

/// k-way merge over a set of same-column decoders: repeatedly emits the
/// smallest current row across all inputs, dropping exact duplicates.
/// Picking the lowest-index store on a tie is sufficient because duplicate
/// rows carry identical data regardless of which store produced them.
struct KWayMerge<'a> {
	decoders: Vec<Decoder<'a>>,
	current: Vec<Row>,
	prev: Row,
	failed: bool,
}

impl<'a> KWayMerge<'a> {
	fn new(mut decoders: Vec<Decoder<'a>>) -> Result<KWayMerge<'a>> {
		let mut current = Vec::with_capacity(decoders.len());
		for decoder in decoders.iter_mut() {
			current.push(decoder.next()?);
		}
		Ok(KWayMerge { decoders, current, prev: Row::NIL, failed: false })
	}
}

impl<'a> Iterator for KWayMerge<'a> {
	type Item = Result<Row>;

	fn next(&mut self) -> Option<Result<Row>> {
		if self.failed {
			return None;
		}

		loop {
			let mut target = None;
			for (i, row) in self.current.iter().enumerate() {
				if row.is_nil() {
					continue;
				}
				if target.map_or(true, |t: usize| *row < self.current[t]) {
					target = Some(i);
				}
			}

			let target = target?;
			let row = self.current[target];

			match self.decoders[target].next() {
				Ok(next_row) => self.current[target] = next_row,
				Err(e) => {
					self.failed = true;
					return Some(Err(e));
				}
			}

			if self.prev.is_nil() || self.prev < row {
				self.prev = row;
				return Some(Ok(row));
			}
			// duplicate of the last emitted row; keep scanning
		}
	}
}

fn create_mapped(path: &Path, cap: usize) -> Result<(File, MmapMut)> {
	let file = OpenOptions::new()
		.read(true)
		.write(true)
		.create_new(true)
		.open(path)
		.map_err(|e| Error::io(path, e))?;
	file.set_len(cap as u64).map_err(|e| Error::io(path, e))?;
	let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| Error::io(path, e))?;
	Ok((file, mmap))
}

/// Shrinks the file to its real used length, then syncs twice with the
/// stamp write in between: once so all row data is durable, once so the
/// "this file is valid" marker can never be observed before the data it
/// certifies.
fn finalize(file: &File, mmap: &mut MmapMut, final_len: usize) -> Result<()> {
	file.set_len(final_len as u64).map_err(|e| Error::io("<store>", e))?;
	mmap.flush().map_err(|e| Error::io("<store>", e))?;
	put_u64(mmap, header_offset::STAMP, STAMP);
	mmap.flush().map_err(|e| Error::io("<store>", e))?;
	Ok(())
}
