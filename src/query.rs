//! Query facade: fans a point lookup or a full iteration out across every
//! store file in a directory and compacts the combined result.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::rowset::RowSet;
use crate::store::{self, Column, Store};

/// A directory of store files opened for reading.
pub struct Query {
	dir: PathBuf,
	stores: Vec<Store>,
}

impl Query {
	/// Scans `dir` for `*.rill` files and opens each as a store. Files that
	/// fail to open are skipped with a logged warning rather than failing
	/// the whole open — one corrupt file should not blind every reader.
	pub fn open(dir: impl Into<PathBuf>) -> Result<Query> {
		let dir = dir.into();
		let stores = store::scan_dir(&dir)?;
		Ok(Query { dir, stores })
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// Number of store files currently open.
	pub fn len(&self) -> usize {
		self.stores.len()
	}

	pub fn is_empty(&self) -> bool {
		self.stores.is_empty()
	}

	/// Re-scans the directory, picking up files written or merged since
	/// `open` (or the last `refresh`).
	pub fn refresh(&mut self) -> Result<()> {
		self.stores = store::scan_dir(&self.dir)?;
		Ok(())
	}

	/// Appends every row matching `key` on `col` across all open stores
	/// into `out`, then compacts so duplicates across stores collapse.
	pub fn key(&self, col: Column, key: u64, out: &mut RowSet) -> Result<()> {
		for store in &self.stores {
			store.query(col, key, out)?;
		}
		out.compact();
		Ok(())
	}

	/// Same as [`Query::key`] but for several keys in one pass.
	pub fn keys(&self, col: Column, keys: &[u64], out: &mut RowSet) -> Result<()> {
		for store in &self.stores {
			for &key in keys {
				store.query(col, key, out)?;
			}
		}
		out.compact();
		Ok(())
	}

	/// Appends every row of `col` across all open stores into `out`, then
	/// compacts.
	pub fn scan(&self, col: Column, out: &mut RowSet) -> Result<()> {
		for store in &self.stores {
			let mut decoder = store.iterate(col)?;
			loop {
				let row = decoder.next()?;
				if row.is_nil() {
					break;
				}
				let emit = match col {
					Column::A => row,
					Column::B => row.inverted(),
				};
				out.push_row(emit);
			}
		}
		out.compact();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rowset::Row;
	use tempfile::tempdir;

	fn write_store(dir: &Path, name: &str, ts: u64, rows: &[(u64, u64)]) {
		let mut set = RowSet::new();
		for &(a, b) in rows {
			set.push(a, b).unwrap();
		}
		Store::write(dir.join(name), ts, 3600, &mut set).unwrap();
	}

	#[test]
	fn fans_out_across_stores() {
		let dir = tempdir().unwrap();
		write_store(dir.path(), "a.rill", 100, &[(1, 10), (2, 20)]);
		write_store(dir.path(), "b.rill", 200, &[(1, 20), (3, 30)]);

		let query = Query::open(dir.path()).unwrap();
		assert_eq!(query.len(), 2);

		let mut out = RowSet::new();
		query.key(Column::A, 1, &mut out).unwrap();
		assert_eq!(out.as_slice(), &[Row::new(1, 10), Row::new(1, 20)]);
	}

	#[test]
	fn dedups_rows_present_in_multiple_stores() {
		let dir = tempdir().unwrap();
		write_store(dir.path(), "a.rill", 100, &[(1, 10)]);
		write_store(dir.path(), "b.rill", 200, &[(1, 10)]);

		let query = Query::open(dir.path()).unwrap();
		let mut out = RowSet::new();
		query.key(Column::A, 1, &mut out).unwrap();
		assert_eq!(out.as_slice(), &[Row::new(1, 10)]);
	}

	#[test]
	fn ignores_the_accumulator_file() {
		let dir = tempdir().unwrap();
		write_store(dir.path(), "a.rill", 100, &[(1, 10)]);
		std::fs::write(dir.path().join("acc"), b"not a store").unwrap();

		let query = Query::open(dir.path()).unwrap();
		assert_eq!(query.len(), 1);
	}

	#[test]
	fn open_on_missing_dir_is_empty() {
		let query = Query::open("/nonexistent/pairdb/path/for/tests").unwrap();
		assert!(query.is_empty());
	}
}
