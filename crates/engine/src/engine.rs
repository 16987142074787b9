// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use quarry_gc::{BlockCompactor, GarbageCollector, GarbageCollectorThread};
use quarry_storage::{
	BlockLayout, BlockStore, BufferSegmentPool, DataTable, DatabaseId, SegmentAllocator, TableId,
};
use quarry_transaction::{TransactionHandle, TransactionManager};
use quarry_wal::{
	LogFileReader, LogManager, TableRegistry, TailRepair, WalSettings,
};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::settings::Settings;

/// The assembled storage and transaction core.
///
/// Startup order: `Engine::start` brings up the pools, the transaction
/// manager, the GC thread and the compactor; the caller then registers its
/// tables with `create_table` and calls `recover`, which replays any
/// existing log with logging disabled and only then starts the log manager.
/// From that point on every commit is durable before its callback fires.
pub struct Engine {
	settings: Settings,
	block_store: Arc<BlockStore>,
	segment_pool: Arc<BufferSegmentPool>,
	txn_manager: Arc<TransactionManager>,
	compactor: Arc<BlockCompactor>,
	log_manager: Mutex<Option<Arc<LogManager>>>,
	gc_thread: Mutex<Option<GarbageCollectorThread>>,
	tables: RwLock<HashMap<(DatabaseId, TableId), Arc<DataTable>>>,
	recovered: std::sync::atomic::AtomicBool,
}

impl Engine {
	pub fn start(settings: Settings) -> Result<Engine> {
		settings.validate()?;
		let block_store = Arc::new(BlockStore::new(
			settings.block_size,
			settings.block_store_size,
			settings.block_store_reuse,
		));
		let segment_pool = Arc::new(BufferSegmentPool::new(
			SegmentAllocator,
			settings.buffer_segment_pool_size,
			settings.buffer_segment_pool_reuse,
		));
		let txn_manager = Arc::new(TransactionManager::new(
			segment_pool.clone(),
			settings.gc_enabled,
		));
		let compactor = Arc::new(BlockCompactor::new(txn_manager.clone()));
		let gc_thread = settings.gc_enabled.then(|| {
			GarbageCollectorThread::spawn(
				GarbageCollector::new(txn_manager.clone()),
				Some(compactor.clone()),
				settings.gc_interval(),
			)
		});
		info!(gc = settings.gc_enabled, "engine started");
		Ok(Engine {
			settings,
			block_store,
			segment_pool,
			txn_manager,
			compactor,
			log_manager: Mutex::new(None),
			gc_thread: Mutex::new(gc_thread),
			tables: RwLock::new(HashMap::new()),
			recovered: std::sync::atomic::AtomicBool::new(false),
		})
	}

	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	pub fn block_store(&self) -> &Arc<BlockStore> {
		&self.block_store
	}

	pub fn segment_pool(&self) -> &Arc<BufferSegmentPool> {
		&self.segment_pool
	}

	pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
		&self.txn_manager
	}

	pub fn compactor(&self) -> &Arc<BlockCompactor> {
		&self.compactor
	}

	/// Registers a table. Must happen before `recover` so replay can
	/// resolve its layout.
	pub fn create_table(
		&self,
		database: DatabaseId,
		table: TableId,
		user_attr_sizes: &[u16],
	) -> Result<Arc<DataTable>> {
		if user_attr_sizes.len() + 1 > self.settings.max_columns as usize {
			return Err(EngineError::InvalidSetting(format!(
				"table exceeds configured max_columns {}",
				self.settings.max_columns
			)));
		}
		let layout = BlockLayout::new(self.settings.block_size, user_attr_sizes)?;
		let mut tables = self.tables.write();
		if tables.contains_key(&(database, table)) {
			return Err(EngineError::TableExists {
				database: database.0,
				table: table.0,
			});
		}
		let data_table = Arc::new(DataTable::new(
			self.block_store.clone(),
			layout,
			database,
			table,
		));
		tables.insert((database, table), data_table.clone());
		Ok(data_table)
	}

	pub fn table(&self, database: DatabaseId, table: TableId) -> Option<Arc<DataTable>> {
		self.tables.read().get(&(database, table)).cloned()
	}

	/// Replays the log (if one exists), repairs any torn tail and starts
	/// the log manager. Must be called exactly once, after the tables are
	/// registered.
	pub fn recover(&self) -> Result<RecoveryReport> {
		if self.recovered.swap(true, std::sync::atomic::Ordering::SeqCst) {
			return Err(EngineError::AlreadyRecovered);
		}
		let Some(path) = self.settings.log_file.clone() else {
			return Ok(RecoveryReport::default());
		};

		let mut report = RecoveryReport::default();
		if path.exists() {
			let snapshot = RegistrySnapshot {
				tables: self.tables.read().clone(),
			};
			let mut reader = LogFileReader::open(&path)?;
			let mut recovery =
				RecoveryManager::new(self.txn_manager.clone(), snapshot.tables.clone());
			while let Some(record) = reader.next_record(&snapshot)? {
				recovery.process(record)?;
			}
			report = recovery.finish();
			if reader.needs_repair() {
				repair_tail(&path, reader.tail_repair())?;
			}
			info!(
				committed = report.committed_transactions,
				discarded = report.discarded_transactions,
				records = report.replayed_records,
				"log replayed"
			);
		}

		let log_manager = Arc::new(LogManager::start(
			&path,
			WalSettings {
				num_buffers: self.settings.wal_num_buffers,
				serialization_interval: self.settings.wal_serialization_interval(),
				flush_interval: self.settings.wal_flush_interval(),
			},
		)?);
		self.txn_manager.attach_log_manager(log_manager.clone());
		*self.log_manager.lock() = Some(log_manager);
		Ok(report)
	}

	pub fn begin(&self) -> TransactionHandle {
		self.txn_manager.begin()
	}

	/// Blocks until everything serialized so far is durable.
	pub fn force_flush(&self) {
		if let Some(log_manager) = self.log_manager.lock().as_ref() {
			log_manager.force_flush();
		}
	}

	/// Orderly shutdown: quiesce transactions, drain and stop the WAL
	/// pipeline (serializer, then writer, then flusher with a final
	/// fsync), then stop the GC after its final reclamation passes.
	pub fn stop(self) {
		self.quiesce(Duration::from_secs(5));
		if let Some(log_manager) = self.log_manager.lock().take() {
			log_manager.stop();
		}
		if let Some(gc_thread) = self.gc_thread.lock().take() {
			gc_thread.stop();
		}
		debug!("engine stopped");
	}

	fn quiesce(&self, timeout: Duration) {
		let deadline = Instant::now() + timeout;
		while self.txn_manager.running_count() > 0 {
			if Instant::now() >= deadline {
				warn!(
					running = self.txn_manager.running_count(),
					"shutdown proceeding with transactions still in flight"
				);
				return;
			}
			std::thread::sleep(Duration::from_millis(1));
		}
	}
}

struct RegistrySnapshot {
	tables: HashMap<(DatabaseId, TableId), Arc<DataTable>>,
}

impl TableRegistry for RegistrySnapshot {
	fn layout(&self, database: DatabaseId, table: TableId) -> Option<&BlockLayout> {
		self.tables.get(&(database, table)).map(|table| table.layout())
	}
}

/// Cuts a torn tail off the log file: keep the sound pages, then rewrite
/// the final partial page to end exactly at the last complete record.
fn repair_tail(path: &std::path::Path, repair: TailRepair) -> Result<()> {
	warn!(
		keep = repair.keep_file_bytes,
		partial = repair.final_payload.len(),
		"truncating torn log tail"
	);
	let mut file = OpenOptions::new()
		.write(true)
		.open(path)
		.map_err(quarry_wal::WalError::Io)?;
	file.set_len(repair.keep_file_bytes)
		.map_err(quarry_wal::WalError::Io)?;
	if !repair.final_payload.is_empty() {
		file.seek(SeekFrom::End(0)).map_err(quarry_wal::WalError::Io)?;
		file.write_all(&quarry_wal::encode_page(&repair.final_payload))
			.map_err(quarry_wal::WalError::Io)?;
	}
	file.sync_data().map_err(quarry_wal::WalError::Io)?;
	Ok(())
}
