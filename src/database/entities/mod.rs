pub mod events;
pub mod media_assets;
pub mod migration_checkpoints;
pub mod migration_jobs;
pub mod migration_logs;
pub mod migration_token_audits;
pub mod migration_tokens;
pub mod orders;
pub mod organizers;
pub mod ticket_tiers;
pub mod tickets;
pub mod users;
pub mod venues;
