pub mod export;
pub mod files;
pub mod health;
pub mod imports;
pub mod jobs;
pub mod restore;
pub mod tokens;
