use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create users table
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Users::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Users::Email).string().not_null().unique_key())
                    .col(ColumnDef::new(Users::DisplayName).string().not_null())
                    .col(ColumnDef::new(Users::PasswordHash).string())
                    .col(ColumnDef::new(Users::IsAdmin).boolean().not_null().default(false))
                    .col(ColumnDef::new(Users::IsActive).boolean().not_null().default(true))
                    .col(ColumnDef::new(Users::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Users::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        // Create organizers table
        manager
            .create_table(
                Table::create()
                    .table(Organizers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Organizers::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Organizers::Slug).string().not_null().unique_key())
                    .col(ColumnDef::new(Organizers::Name).string().not_null())
                    .col(ColumnDef::new(Organizers::ContactEmail).string())
                    .col(ColumnDef::new(Organizers::OwnerId).string())
                    .col(ColumnDef::new(Organizers::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Organizers::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-organizers-owner_id")
                            .from(Organizers::Table, Organizers::OwnerId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create venues table
        manager
            .create_table(
                Table::create()
                    .table(Venues::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Venues::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Venues::Slug).string().not_null().unique_key())
                    .col(ColumnDef::new(Venues::Name).string().not_null())
                    .col(ColumnDef::new(Venues::Address).string())
                    .col(ColumnDef::new(Venues::City).string())
                    .col(ColumnDef::new(Venues::Capacity).integer())
                    .col(ColumnDef::new(Venues::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Venues::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        // Create events table
        manager
            .create_table(
                Table::create()
                    .table(Events::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Events::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Events::Slug).string().not_null().unique_key())
                    .col(ColumnDef::new(Events::Title).string().not_null())
                    .col(ColumnDef::new(Events::Description).text())
                    .col(ColumnDef::new(Events::StartsAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Events::Status).string().not_null())
                    .col(ColumnDef::new(Events::OrganizerId).string().not_null())
                    .col(ColumnDef::new(Events::VenueId).string())
                    .col(ColumnDef::new(Events::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Events::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-events-organizer_id")
                            .from(Events::Table, Events::OrganizerId)
                            .to(Organizers::Table, Organizers::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-events-venue_id")
                            .from(Events::Table, Events::VenueId)
                            .to(Venues::Table, Venues::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create ticket_tiers table
        manager
            .create_table(
                Table::create()
                    .table(TicketTiers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TicketTiers::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TicketTiers::EventId).string().not_null())
                    .col(ColumnDef::new(TicketTiers::Name).string().not_null())
                    .col(ColumnDef::new(TicketTiers::PriceCents).big_integer().not_null())
                    .col(ColumnDef::new(TicketTiers::Quantity).integer().not_null())
                    .col(ColumnDef::new(TicketTiers::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(TicketTiers::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-ticket_tiers-event_id")
                            .from(TicketTiers::Table, TicketTiers::EventId)
                            .to(Events::Table, Events::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create orders table
        manager
            .create_table(
                Table::create()
                    .table(Orders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Orders::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Orders::Reference).string().not_null().unique_key())
                    .col(ColumnDef::new(Orders::UserId).string().not_null())
                    .col(ColumnDef::new(Orders::EventId).string().not_null())
                    .col(ColumnDef::new(Orders::Status).string().not_null())
                    .col(ColumnDef::new(Orders::TotalCents).big_integer().not_null())
                    .col(ColumnDef::new(Orders::PlacedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Orders::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Orders::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-orders-user_id")
                            .from(Orders::Table, Orders::UserId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-orders-event_id")
                            .from(Orders::Table, Orders::EventId)
                            .to(Events::Table, Events::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create tickets table
        manager
            .create_table(
                Table::create()
                    .table(Tickets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tickets::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Tickets::Serial).string().not_null().unique_key())
                    .col(ColumnDef::new(Tickets::OrderId).string().not_null())
                    .col(ColumnDef::new(Tickets::TierId).string().not_null())
                    .col(ColumnDef::new(Tickets::AttendeeName).string())
                    .col(ColumnDef::new(Tickets::CheckedIn).boolean().not_null().default(false))
                    .col(ColumnDef::new(Tickets::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Tickets::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-tickets-order_id")
                            .from(Tickets::Table, Tickets::OrderId)
                            .to(Orders::Table, Orders::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-tickets-tier_id")
                            .from(Tickets::Table, Tickets::TierId)
                            .to(TicketTiers::Table, TicketTiers::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create media_assets table
        manager
            .create_table(
                Table::create()
                    .table(MediaAssets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(MediaAssets::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(MediaAssets::FilePath).string().not_null().unique_key())
                    .col(ColumnDef::new(MediaAssets::ContentType).string().not_null())
                    .col(ColumnDef::new(MediaAssets::SizeBytes).big_integer().not_null())
                    .col(ColumnDef::new(MediaAssets::Checksum).string().not_null())
                    .col(ColumnDef::new(MediaAssets::EventId).string())
                    .col(ColumnDef::new(MediaAssets::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(MediaAssets::UpdatedAt).timestamp_with_time_zone().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-media_assets-event_id")
                            .from(MediaAssets::Table, MediaAssets::EventId)
                            .to(Events::Table, Events::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Create indexes for common lookups
        manager
            .create_index(
                Index::create()
                    .name("idx-events-organizer_id")
                    .table(Events::Table)
                    .col(Events::OrganizerId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-orders-event_id")
                    .table(Orders::Table)
                    .col(Orders::EventId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-tickets-order_id")
                    .table(Tickets::Table)
                    .col(Tickets::OrderId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(MediaAssets::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Tickets::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Orders::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TicketTiers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Events::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Venues::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Organizers::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(Iden)]
enum Users {
    Table,
    Id,
    Email,
    DisplayName,
    PasswordHash,
    IsAdmin,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Organizers {
    Table,
    Id,
    Slug,
    Name,
    ContactEmail,
    OwnerId,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Venues {
    Table,
    Id,
    Slug,
    Name,
    Address,
    City,
    Capacity,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Events {
    Table,
    Id,
    Slug,
    Title,
    Description,
    StartsAt,
    Status,
    OrganizerId,
    VenueId,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum TicketTiers {
    Table,
    Id,
    EventId,
    Name,
    PriceCents,
    Quantity,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Orders {
    Table,
    Id,
    Reference,
    UserId,
    EventId,
    Status,
    TotalCents,
    PlacedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Tickets {
    Table,
    Id,
    Serial,
    OrderId,
    TierId,
    AttendeeName,
    CheckedIn,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum MediaAssets {
    Table,
    Id,
    FilePath,
    ContentType,
    SizeBytes,
    Checksum,
    EventId,
    CreatedAt,
    UpdatedAt,
}
