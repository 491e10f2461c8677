//! Host implementations of the collaborator traits.
//!
//! TEAM_301: Enabled for unit tests and with the `std` feature, so dependent
//! crates can run the pager end to end under `cargo test`.

mod mem_file;
mod ram_disk;
mod soft_mmu;

pub use mem_file::MemFile;
pub use ram_disk::RamDisk;
pub use soft_mmu::SoftMmu;
