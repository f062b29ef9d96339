//! Entity catalog for the migration engine.
//!
//! The catalog is the single authority on which platform entities take part
//! in a migration, in what order they must be applied, and how conflicts on
//! each of them are detected. Engines never enumerate entity types
//! themselves; they walk `EntityKind::dependency_order()` and go through the
//! [`EntityBatch`] adapters returned by [`adapters`].

use std::marker::PhantomData;
use std::str::FromStr;

use async_trait::async_trait;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, Iterable, ModelTrait, PaginatorTrait, PrimaryKeyToColumn, QueryFilter,
    QueryOrder,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::database::entities::{
    events, media_assets, orders, organizers, ticket_tiers, tickets, users, venues,
};
use crate::errors::{MigrationError, Result};

/// The platform entity types covered by export/import, in no particular
/// order. Apply order comes from [`EntityKind::dependency_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Users,
    Organizers,
    Venues,
    Events,
    TicketTiers,
    Orders,
    Tickets,
    MediaAssets,
}

impl EntityKind {
    /// Parents strictly before children. The import engine applies kinds in
    /// this order and the checkpoint store deletes in the reverse of it, so
    /// foreign keys hold at every intermediate state.
    pub fn dependency_order() -> &'static [EntityKind] {
        &[
            EntityKind::Users,
            EntityKind::Organizers,
            EntityKind::Venues,
            EntityKind::Events,
            EntityKind::TicketTiers,
            EntityKind::Orders,
            EntityKind::Tickets,
            EntityKind::MediaAssets,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Users => "users",
            EntityKind::Organizers => "organizers",
            EntityKind::Venues => "venues",
            EntityKind::Events => "events",
            EntityKind::TicketTiers => "ticket_tiers",
            EntityKind::Orders => "orders",
            EntityKind::Tickets => "tickets",
            EntityKind::MediaAssets => "media_assets",
        }
    }

    /// Columns that identify a record besides its primary key. Conflict
    /// detection checks the primary key first, then these in order.
    pub fn unique_columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Users => &["email"],
            EntityKind::Organizers => &["slug"],
            EntityKind::Venues => &["slug"],
            EntityKind::Events => &["slug"],
            EntityKind::TicketTiers => &[],
            EntityKind::Orders => &["reference"],
            EntityKind::Tickets => &["serial"],
            EntityKind::MediaAssets => &["file_path"],
        }
    }

    /// Boolean columns a merge must never lower from `true` on the target.
    pub fn protected_columns(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Users => &["is_admin"],
            _ => &[],
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "users" => Ok(EntityKind::Users),
            "organizers" => Ok(EntityKind::Organizers),
            "venues" => Ok(EntityKind::Venues),
            "events" => Ok(EntityKind::Events),
            "ticket_tiers" => Ok(EntityKind::TicketTiers),
            "orders" => Ok(EntityKind::Orders),
            "tickets" => Ok(EntityKind::Tickets),
            "media_assets" => Ok(EntityKind::MediaAssets),
            other => Err(MigrationError::Validation(format!(
                "unknown entity kind: {}",
                other
            ))),
        }
    }
}

/// How the import engine treats records that already exist on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyPolicy {
    Merge,
    SkipExisting,
    Overwrite,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        ApplyPolicy::Merge
    }
}

impl FromStr for ApplyPolicy {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "merge" => Ok(ApplyPolicy::Merge),
            "skip-existing" => Ok(ApplyPolicy::SkipExisting),
            "overwrite" => Ok(ApplyPolicy::Overwrite),
            other => Err(MigrationError::Validation(format!(
                "unknown apply policy: {}",
                other
            ))),
        }
    }
}

/// Outcome counters for one applied chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl ApplyStats {
    pub fn absorb(&mut self, other: ApplyStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }

    pub fn processed(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Uniform data-plane access to one entity kind. Everything the engines do
/// to platform tables goes through this seam; records cross it as JSON
/// objects, the same shape they have inside archive chunks.
#[async_trait]
pub trait EntityBatch: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn count(&self, db: &DatabaseConnection) -> Result<u64>;

    /// Fetch one page of records ordered by primary key, optionally limited
    /// to rows updated at or after `changed_since`.
    async fn fetch_chunk(
        &self,
        db: &DatabaseConnection,
        page: u64,
        page_size: u64,
        changed_since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<serde_json::Value>>;

    /// Apply a chunk of records under the given policy.
    async fn apply_chunk(
        &self,
        db: &DatabaseConnection,
        records: &[serde_json::Value],
        policy: ApplyPolicy,
    ) -> Result<ApplyStats>;

    /// Remove every row of this kind. Only the checkpoint store calls this,
    /// and only in reverse dependency order.
    async fn delete_all(&self, db: &DatabaseConnection) -> Result<u64>;
}

/// Generic [`EntityBatch`] over a sea-orm entity with a string primary key.
pub struct Adapter<E, A> {
    kind: EntityKind,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Adapter<E, A> {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E, A> EntityBatch for Adapter<E, A>
where
    E: EntityTrait,
    E::Model: Serialize + DeserializeOwned + IntoActiveModel<A> + Send + Sync,
    E::Column: FromStr,
    <E::Column as FromStr>::Err: Send,
    E::PrimaryKey: PrimaryKeyToColumn<Column = E::Column>,
    <E::PrimaryKey as sea_orm::PrimaryKeyTrait>::ValueType: From<String>,
    A: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send + 'static,
{
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn count(&self, db: &DatabaseConnection) -> Result<u64> {
        Ok(E::find().count(db).await?)
    }

    async fn fetch_chunk(
        &self,
        db: &DatabaseConnection,
        page: u64,
        page_size: u64,
        changed_since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<serde_json::Value>> {
        let mut query = E::find();
        if let Some(pk) = E::PrimaryKey::iter().next() {
            query = query.order_by_asc(pk.into_column());
        }
        if let (Some(since), Ok(col)) = (changed_since, E::Column::from_str("updated_at")) {
            query = query.filter(col.gte(since));
        }
        let models = query.paginate(db, page_size).fetch_page(page).await?;
        models
            .iter()
            .map(|m| serde_json::to_value(m).map_err(MigrationError::from))
            .collect()
    }

    async fn apply_chunk(
        &self,
        db: &DatabaseConnection,
        records: &[serde_json::Value],
        policy: ApplyPolicy,
    ) -> Result<ApplyStats> {
        let mut stats = ApplyStats::default();
        for record in records {
            let incoming: E::Model = serde_json::from_value(record.clone())?;
            let existing = self.find_existing(db, record).await?;

            match existing {
                None => {
                    let am = incoming.into_active_model().reset_all();
                    E::insert(am).exec(db).await?;
                    stats.inserted += 1;
                }
                Some(_) if policy == ApplyPolicy::SkipExisting => {
                    stats.skipped += 1;
                }
                Some(current) => {
                    let mut am = incoming.into_active_model().reset_all();
                    // The target row keeps its identity even when the match
                    // came from a unique column rather than the primary key.
                    if let Some(pk) = E::PrimaryKey::iter().next() {
                        let col = pk.into_column();
                        am.set(col, current.get(col));
                    }
                    if policy == ApplyPolicy::Merge {
                        for name in self.kind.protected_columns() {
                            if let Ok(col) = E::Column::from_str(name) {
                                let local = current.get(col);
                                if local == sea_orm::Value::Bool(Some(true)) {
                                    am.set(col, local);
                                }
                            }
                        }
                    }
                    am.update(db).await?;
                    stats.updated += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn delete_all(&self, db: &DatabaseConnection) -> Result<u64> {
        let res = E::delete_many().exec(db).await?;
        Ok(res.rows_affected)
    }
}

impl<E, A> Adapter<E, A>
where
    E: EntityTrait,
    E::Model: Serialize + DeserializeOwned + IntoActiveModel<A> + Send + Sync,
    E::Column: FromStr,
    <E::Column as FromStr>::Err: Send,
    E::PrimaryKey: PrimaryKeyToColumn<Column = E::Column>,
    <E::PrimaryKey as sea_orm::PrimaryKeyTrait>::ValueType: From<String>,
    A: ActiveModelTrait<Entity = E> + ActiveModelBehavior + Send + 'static,
{
    /// Primary key first, then the catalog's unique columns.
    async fn find_existing(
        &self,
        db: &DatabaseConnection,
        record: &serde_json::Value,
    ) -> Result<Option<E::Model>> {
        if let Some(id) = record.get("id").and_then(|v| v.as_str()) {
            if let Some(found) = E::find_by_id(id.to_string()).one(db).await? {
                return Ok(Some(found));
            }
        }
        for name in self.kind.unique_columns() {
            let value = match record.get(*name).and_then(|v| v.as_str()) {
                Some(v) => v,
                None => continue,
            };
            if let Ok(col) = E::Column::from_str(name) {
                if let Some(found) = E::find().filter(col.eq(value)).one(db).await? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }
}

/// All adapters in dependency order.
pub fn adapters() -> Vec<Box<dyn EntityBatch>> {
    vec![
        Box::new(Adapter::<users::Entity, users::ActiveModel>::new(
            EntityKind::Users,
        )),
        Box::new(Adapter::<organizers::Entity, organizers::ActiveModel>::new(
            EntityKind::Organizers,
        )),
        Box::new(Adapter::<venues::Entity, venues::ActiveModel>::new(
            EntityKind::Venues,
        )),
        Box::new(Adapter::<events::Entity, events::ActiveModel>::new(
            EntityKind::Events,
        )),
        Box::new(
            Adapter::<ticket_tiers::Entity, ticket_tiers::ActiveModel>::new(
                EntityKind::TicketTiers,
            ),
        ),
        Box::new(Adapter::<orders::Entity, orders::ActiveModel>::new(
            EntityKind::Orders,
        )),
        Box::new(Adapter::<tickets::Entity, tickets::ActiveModel>::new(
            EntityKind::Tickets,
        )),
        Box::new(
            Adapter::<media_assets::Entity, media_assets::ActiveModel>::new(
                EntityKind::MediaAssets,
            ),
        ),
    ]
}

/// Adapter for a single kind.
pub fn adapter_for(kind: EntityKind) -> Box<dyn EntityBatch> {
    adapters()
        .into_iter()
        .find(|a| a.kind() == kind)
        .unwrap_or_else(|| unreachable!("catalog covers every EntityKind"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_order_covers_every_kind_once() {
        let order = EntityKind::dependency_order();
        assert_eq!(order.len(), 8);
        for kind in order {
            assert_eq!(order.iter().filter(|k| *k == kind).count(), 1);
        }
    }

    #[test]
    fn parents_precede_children() {
        let order = EntityKind::dependency_order();
        let pos = |k: EntityKind| order.iter().position(|x| *x == k).unwrap();
        assert!(pos(EntityKind::Users) < pos(EntityKind::Organizers));
        assert!(pos(EntityKind::Organizers) < pos(EntityKind::Events));
        assert!(pos(EntityKind::Venues) < pos(EntityKind::Events));
        assert!(pos(EntityKind::Events) < pos(EntityKind::TicketTiers));
        assert!(pos(EntityKind::Users) < pos(EntityKind::Orders));
        assert!(pos(EntityKind::Events) < pos(EntityKind::Orders));
        assert!(pos(EntityKind::Orders) < pos(EntityKind::Tickets));
        assert!(pos(EntityKind::TicketTiers) < pos(EntityKind::Tickets));
        assert!(pos(EntityKind::Events) < pos(EntityKind::MediaAssets));
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in EntityKind::dependency_order() {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), *kind);
        }
        assert!("projects".parse::<EntityKind>().is_err());
    }

    #[test]
    fn apply_policy_parses_kebab_case() {
        assert_eq!("merge".parse::<ApplyPolicy>().unwrap(), ApplyPolicy::Merge);
        assert_eq!(
            "skip-existing".parse::<ApplyPolicy>().unwrap(),
            ApplyPolicy::SkipExisting
        );
        assert_eq!(
            "overwrite".parse::<ApplyPolicy>().unwrap(),
            ApplyPolicy::Overwrite
        );
        assert!("upsert".parse::<ApplyPolicy>().is_err());
    }

    #[test]
    fn only_users_carry_protected_columns() {
        assert_eq!(EntityKind::Users.protected_columns(), &["is_admin"]);
        assert!(EntityKind::Orders.protected_columns().is_empty());
    }

    #[test]
    fn adapters_follow_dependency_order() {
        let kinds: Vec<EntityKind> = adapters().iter().map(|a| a.kind()).collect();
        assert_eq!(kinds.as_slice(), EntityKind::dependency_order());
    }
}
