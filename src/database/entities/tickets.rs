use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tickets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub serial: String,
    pub order_id: String,
    pub tier_id: String,
    pub attendee_name: Option<String>,
    pub checked_in: bool,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::orders::Entity",
        from = "Column::OrderId",
        to = "super::orders::Column::Id"
    )]
    Orders,
    #[sea_orm(
        belongs_to = "super::ticket_tiers::Entity",
        from = "Column::TierId",
        to = "super::ticket_tiers::Column::Id"
    )]
    TicketTiers,
}

impl Related<super::orders::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl Related<super::ticket_tiers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TicketTiers.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
