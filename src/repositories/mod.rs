pub mod readings;
pub mod snapshots;
pub mod tariffs;

pub use readings::ReadingRepository;
pub use snapshots::SnapshotRepository;
pub use tariffs::TariffRepository;
