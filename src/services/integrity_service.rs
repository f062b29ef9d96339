//! Integrity verification: per-kind record counts plus orphaned
//! foreign-key detection across the platform tables.
//!
//! Used by the import engine's verify phase and exposed directly through
//! `POST /verify` so an operator can audit a target without importing.

use std::collections::{BTreeMap, HashSet};

use sea_orm::{DatabaseConnection, EntityTrait};
use serde::Serialize;

use crate::archive::Manifest;
use crate::catalog::{adapters, EntityKind};
use crate::database::entities::{
    events, media_assets, orders, organizers, ticket_tiers, tickets, users, venues,
};
use crate::errors::{MigrationError, Result};

#[derive(Debug, Clone, Serialize, Default)]
pub struct IntegrityReport {
    pub counts: BTreeMap<String, u64>,
    /// One line per dangling reference, e.g. `events.organizer_id -> <id>`.
    pub orphans: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}

#[derive(Clone)]
pub struct IntegrityService {
    db: DatabaseConnection,
}

impl IntegrityService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for adapter in adapters() {
            counts.insert(
                adapter.kind().as_str().to_string(),
                adapter.count(&self.db).await?,
            );
        }
        Ok(counts)
    }

    /// Full sweep: counts plus every dangling foreign key.
    pub async fn verify(&self) -> Result<IntegrityReport> {
        let mut report = IntegrityReport {
            counts: self.counts().await?,
            orphans: Vec::new(),
        };

        let user_ids: HashSet<String> = users::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();
        let organizer_ids: HashSet<String> = organizers::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|o| o.id)
            .collect();
        let venue_ids: HashSet<String> = venues::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|v| v.id)
            .collect();
        let event_ids: HashSet<String> = events::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();
        let tier_ids: HashSet<String> = ticket_tiers::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        let order_ids: HashSet<String> = orders::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|o| o.id)
            .collect();

        for organizer in organizers::Entity::find().all(&self.db).await? {
            if let Some(owner) = &organizer.owner_id {
                if !user_ids.contains(owner) {
                    report
                        .orphans
                        .push(format!("organizers.owner_id -> {}", owner));
                }
            }
        }
        for event in events::Entity::find().all(&self.db).await? {
            if !organizer_ids.contains(&event.organizer_id) {
                report
                    .orphans
                    .push(format!("events.organizer_id -> {}", event.organizer_id));
            }
            if let Some(venue) = &event.venue_id {
                if !venue_ids.contains(venue) {
                    report.orphans.push(format!("events.venue_id -> {}", venue));
                }
            }
        }
        for tier in ticket_tiers::Entity::find().all(&self.db).await? {
            if !event_ids.contains(&tier.event_id) {
                report
                    .orphans
                    .push(format!("ticket_tiers.event_id -> {}", tier.event_id));
            }
        }
        for order in orders::Entity::find().all(&self.db).await? {
            if !user_ids.contains(&order.user_id) {
                report
                    .orphans
                    .push(format!("orders.user_id -> {}", order.user_id));
            }
            if !event_ids.contains(&order.event_id) {
                report
                    .orphans
                    .push(format!("orders.event_id -> {}", order.event_id));
            }
        }
        for ticket in tickets::Entity::find().all(&self.db).await? {
            if !order_ids.contains(&ticket.order_id) {
                report
                    .orphans
                    .push(format!("tickets.order_id -> {}", ticket.order_id));
            }
            if !tier_ids.contains(&ticket.tier_id) {
                report
                    .orphans
                    .push(format!("tickets.tier_id -> {}", ticket.tier_id));
            }
        }
        for asset in media_assets::Entity::find().all(&self.db).await? {
            if let Some(event) = &asset.event_id {
                if !event_ids.contains(event) {
                    report
                        .orphans
                        .push(format!("media_assets.event_id -> {}", event));
                }
            }
        }

        Ok(report)
    }

    /// Post-import check against a manifest: every declared record must be
    /// present (the target may legitimately hold more when merging into a
    /// populated environment), and no foreign key may dangle.
    pub async fn verify_against_manifest(&self, manifest: &Manifest) -> Result<IntegrityReport> {
        let report = self.verify().await?;
        for kind in EntityKind::dependency_order() {
            let section = match manifest.section(*kind) {
                Some(section) => section,
                None => continue,
            };
            let target = report.counts.get(kind.as_str()).copied().unwrap_or(0);
            if target < section.count {
                return Err(MigrationError::Integrity(format!(
                    "count mismatch for {}: manifest {} target {}",
                    kind, section.count, target
                )));
            }
        }
        if !report.is_clean() {
            return Err(MigrationError::Integrity(format!(
                "{} orphaned foreign keys after import (first: {})",
                report.orphans.len(),
                report.orphans[0]
            )));
        }
        Ok(report)
    }
}
