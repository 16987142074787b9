// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::path::Path;

/// Runs `f` with a scratch directory that is removed afterwards, even when
/// the closure panics.
pub fn temp_dir<T>(f: impl FnOnce(&Path) -> T) -> T {
	let dir = tempfile::TempDir::new().expect("create temp dir");
	f(dir.path())
}
