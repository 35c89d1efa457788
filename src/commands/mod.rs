pub mod init_db;
pub mod rebuild_positions;
pub mod report;
pub mod serve;
pub mod sync_orders;
