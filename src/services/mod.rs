pub mod checkpoint_service;
pub mod export_service;
pub mod import_service;
pub mod integrity_service;
pub mod restore;
pub mod sync_service;
pub mod token_service;
pub mod transfer_service;

pub use checkpoint_service::CheckpointService;
pub use export_service::ExportService;
pub use import_service::ImportService;
pub use integrity_service::IntegrityService;
pub use restore::RestoreOrchestrator;
pub use sync_service::SyncService;
pub use token_service::TokenService;
pub use transfer_service::FileTransferService;
