// Copyright (c) quarrydb.io 2025
// This file is licensed under the Apache-2.0, see license.md file

use std::fmt::{Display, Formatter};

/// Identifies a database in redo records and the recovery table registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatabaseId(pub u32);

/// Identifies a table within a database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u32);

/// Identifies a physical column within a block layout. Column 0 is reserved
/// for the version pointer; user columns start at 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnId(pub u16);

/// The reserved column whose value array holds per-slot version pointers and
/// whose bitmap doubles as the slot-presence bitmap.
pub const VERSION_POINTER_COLUMN: ColumnId = ColumnId(0);

impl Display for DatabaseId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "db:{}", self.0)
	}
}

impl Display for TableId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "table:{}", self.0)
	}
}

impl Display for ColumnId {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "col:{}", self.0)
	}
}
