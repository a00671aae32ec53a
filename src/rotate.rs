//! Rotation: merges a directory's store files up through the hour/day/week/
//! month quanta and expires anything past the retention horizon.
//!
//! Serialized across processes by an advisory, non-blocking exclusive lock
//! on the directory itself — a rotator that can't acquire the lock treats
//! that as "someone else is already rotating" and returns success having
//! done nothing.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::config::{Options, DAYS_IN_WEEK, HOURS_IN_DAY, WEEKS_IN_MONTH};
use crate::error::{Error, Result};
use crate::store::{self, Store};

/// Drives rotation for one data directory.
pub struct Rotator {
	dir: PathBuf,
	options: Options,
}

impl Rotator {
	pub fn new(dir: impl Into<PathBuf>, options: Options) -> Rotator {
		Rotator { dir: dir.into(), options }
	}

	/// Runs one rotation pass as of `now`. A no-op (but still `Ok`) if
	/// another rotator currently holds the directory lock.
	pub fn run(&self, now: u64) -> Result<()> {
		let lock_file = File::open(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
		if lock_file.try_lock_exclusive().is_err() {
			log::info!(target: "pairdb", "rotation skipped: '{}' is locked", self.dir.display());
			return Ok(());
		}

		let result = self.run_locked(now);
		let _ = lock_file.unlock();
		result
	}

	fn run_locked(&self, now: u64) -> Result<()> {
		let mut stores = store::scan_dir(&self.dir)?;
		stores.sort_unstable_by(|a, b| b.ts().cmp(&a.ts()));

		stores = self.expire(stores, now)?;
		for quant in self.options.quanta() {
			stores = self.merge_quant(stores, now, quant)?;
		}

		Ok(())
	}

	/// Drops every store older than the retention horizon. Short-circuits
	/// when `now` itself predates the horizon, so fixtures using small
	/// synthetic timestamps don't expire everything immediately.
	fn expire(&self, stores: Vec<Store>, now: u64) -> Result<Vec<Store>> {
		if now < self.options.retention_secs {
			return Ok(stores);
		}
		let horizon = now - self.options.retention_secs;

		let mut kept = Vec::with_capacity(stores.len());
		for store in stores {
			if store.ts() < horizon {
				log::info!(
					target: "pairdb",
					"expiring '{}' (ts={}, horizon={})", store.file().display(), store.ts(), horizon,
				);
				store.remove()?;
			} else {
				kept.push(store);
			}
		}
		Ok(kept)
	}

	/// Merges `stores` (sorted descending by timestamp) within `quant`:
	/// groups of files sharing a bucket are combined into one file, except
	/// the bucket `now` currently falls in, which is still accumulating and
	/// is left untouched (and excluded from the next, coarser quantum pass).
	fn merge_quant(&self, stores: Vec<Store>, now: u64, quant: u64) -> Result<Vec<Store>> {
		if stores.len() <= 1 {
			return Ok(stores);
		}

		let mut groups: Vec<Vec<Store>> = Vec::new();
		let mut iter = stores.into_iter().peekable();
		while let Some(first) = iter.next() {
			let bucket = first.ts() / quant;
			let mut group = vec![first];
			while let Some(next) = iter.peek() {
				if next.ts() / quant != bucket {
					break;
				}
				group.push(iter.next().unwrap());
			}
			groups.push(group);
		}

		let current_bucket = now / quant;
		let mut out = Vec::with_capacity(groups.len());
		for group in groups {
			let bucket = group[0].ts() / quant;
			if bucket == current_bucket {
				// Still filling; leave on disk, drop from further rotation.
				continue;
			}
			if group.len() == 1 {
				out.push(group.into_iter().next().unwrap());
				continue;
			}

			let ts = group[0].ts();
			let path = self.file_name(ts, quant)?;
			{
				let refs: Vec<&Store> = group.iter().collect();
				Store::merge(&refs, &path, ts, quant)?;
			}
			let merged = Store::open(&path)?;
			for store in group {
				store.remove()?;
			}
			out.push(merged);
		}

		Ok(out)
	}

	fn file_name(&self, ts: u64, quant: u64) -> Result<PathBuf> {
		let opts = &self.options;
		let month = ts / opts.month_secs;
		let week = (ts / opts.week_secs) % WEEKS_IN_MONTH;
		let day = (ts / opts.day_secs) % DAYS_IN_WEEK;
		let hour = (ts / opts.hour_secs) % HOURS_IN_DAY;

		let base = if quant == opts.hour_secs {
			format!("{:05}-{:02}-{:02}-{:02}.rill", month, week, day, hour)
		} else if quant == opts.day_secs {
			format!("{:05}-{:02}-{:02}.rill", month, week, day)
		} else if quant == opts.week_secs {
			format!("{:05}-{:02}.rill", month, week)
		} else if quant == opts.month_secs {
			format!("{:05}.rill", month)
		} else {
			return Err(Error::InvalidArgument(format!("unrecognized rotation quantum {}", quant)));
		};

		let mut path = self.dir.join(&base);
		let mut suffix = 0u32;
		while path.exists() {
			path = self.dir.join(format!("{}.{}", base, suffix));
			suffix += 1;
		}
		Ok(path)
	}
}
