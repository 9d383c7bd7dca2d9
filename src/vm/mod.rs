//! Virtual memory: the global frame table with clock replacement, the
//! swap table, and the per-process supplemental page tables.

pub mod frame;
pub mod page;
pub mod swap;
