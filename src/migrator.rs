use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_catalog_tables::Migration),
            Box::new(m20240101_000002_create_cart_tables::Migration),
            Box::new(m20240101_000003_create_order_tables::Migration),
            Box::new(m20240101_000004_create_refunds_table::Migration),
            Box::new(m20240101_000005_create_ledger_support_tables::Migration),
        ]
    }
}

mod m20240101_000001_create_catalog_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Products::Title).string().not_null())
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Variants::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Variants::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Variants::ProductId).uuid().not_null())
                        .col(ColumnDef::new(Variants::Sku).string().not_null())
                        .col(ColumnDef::new(Variants::Title).string().null())
                        .col(ColumnDef::new(Variants::PriceCents).big_integer().not_null())
                        .col(ColumnDef::new(Variants::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Variants::VatRate)
                                .decimal_len(5, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Variants::StockQty).integer().null())
                        .col(
                            ColumnDef::new(Variants::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Variants::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_variants_product_id")
                                .from(Variants::Table, Variants::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_variants_sku")
                        .table(Variants::Table)
                        .col(Variants::Sku)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Variants::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        Title,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum Variants {
        Table,
        Id,
        ProductId,
        Sku,
        Title,
        PriceCents,
        Currency,
        VatRate,
        StockQty,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240101_000002_create_cart_tables {

    use super::m20240101_000001_create_catalog_tables::Variants;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_cart_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Carts::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Carts::CustomerId).uuid().null())
                        .col(ColumnDef::new(Carts::Email).string().null())
                        .col(ColumnDef::new(Carts::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Carts::ShippingName).string().null())
                        .col(ColumnDef::new(Carts::ShippingPhone).string().null())
                        .col(ColumnDef::new(Carts::ShippingAddr1).string().null())
                        .col(ColumnDef::new(Carts::ShippingAddr2).string().null())
                        .col(ColumnDef::new(Carts::ShippingCity).string().null())
                        .col(ColumnDef::new(Carts::ShippingPostal).string().null())
                        .col(ColumnDef::new(Carts::ShippingCountry).string().null())
                        .col(
                            ColumnDef::new(Carts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Carts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CartLines::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(CartLines::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(CartLines::CartId).uuid().not_null())
                        .col(ColumnDef::new(CartLines::VariantId).uuid().not_null())
                        .col(
                            ColumnDef::new(CartLines::Quantity)
                                .integer()
                                .not_null()
                                .check(Expr::col(CartLines::Quantity).gte(1)),
                        )
                        .col(
                            ColumnDef::new(CartLines::UnitPriceCents)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CartLines::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_lines_cart_id")
                                .from(CartLines::Table, CartLines::CartId)
                                .to(Carts::Table, Carts::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_lines_variant_id")
                                .from(CartLines::Table, CartLines::VariantId)
                                .to(Variants::Table, Variants::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_lines_cart_id")
                        .table(CartLines::Table)
                        .col(CartLines::CartId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Carts {
        Table,
        Id,
        CustomerId,
        Email,
        Currency,
        ShippingName,
        ShippingPhone,
        ShippingAddr1,
        ShippingAddr2,
        ShippingCity,
        ShippingPostal,
        ShippingCountry,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CartLines {
        Table,
        Id,
        CartId,
        VariantId,
        Quantity,
        UnitPriceCents,
        CreatedAt,
    }
}

mod m20240101_000003_create_order_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Orders::CustomerId).uuid().null())
                        .col(ColumnDef::new(Orders::Email).string().null())
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::SubtotalCents).big_integer().not_null())
                        .col(ColumnDef::new(Orders::TaxCents).big_integer().not_null())
                        .col(ColumnDef::new(Orders::ShippingCents).big_integer().not_null())
                        .col(ColumnDef::new(Orders::TotalCents).big_integer().not_null())
                        .col(ColumnDef::new(Orders::ShippingName).string().null())
                        .col(ColumnDef::new(Orders::ShippingPhone).string().null())
                        .col(ColumnDef::new(Orders::ShippingAddr1).string().null())
                        .col(ColumnDef::new(Orders::ShippingAddr2).string().null())
                        .col(ColumnDef::new(Orders::ShippingCity).string().null())
                        .col(ColumnDef::new(Orders::ShippingPostal).string().null())
                        .col(ColumnDef::new(Orders::ShippingCountry).string().null())
                        .col(ColumnDef::new(Orders::ProviderSessionId).string().null())
                        .col(ColumnDef::new(Orders::ProviderIntentId).string().null())
                        .col(ColumnDef::new(Orders::CartId).uuid().null())
                        .col(
                            ColumnDef::new(Orders::PaymentStatus)
                                .string_len(24)
                                .not_null()
                                .default("UNPAID"),
                        )
                        .col(
                            ColumnDef::new(Orders::FulfillmentStatus)
                                .string_len(16)
                                .not_null()
                                .default("PENDING"),
                        )
                        .col(ColumnDef::new(Orders::FailureReason).string().null())
                        .col(ColumnDef::new(Orders::Carrier).string().null())
                        .col(ColumnDef::new(Orders::TrackingNumber).string().null())
                        .col(ColumnDef::new(Orders::TrackingUrl).string().null())
                        .col(
                            ColumnDef::new(Orders::ConfirmationEmailSent)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One order per checkout session and per payment intent
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_provider_session_id")
                        .table(Orders::Table)
                        .col(Orders::ProviderSessionId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_provider_intent_id")
                        .table(Orders::Table)
                        .col(Orders::ProviderIntentId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_email")
                        .table(Orders::Table)
                        .col(Orders::Email)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderLines::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(OrderLines::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(OrderLines::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderLines::VariantId).uuid().null())
                        .col(ColumnDef::new(OrderLines::Title).string().not_null())
                        .col(ColumnDef::new(OrderLines::Sku).string().not_null())
                        .col(ColumnDef::new(OrderLines::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderLines::UnitPriceCents)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderLines::TaxRate)
                                .decimal_len(5, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderLines::LineTotalCents)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OrderLines::TaxCents).big_integer().not_null())
                        .col(
                            ColumnDef::new(OrderLines::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_lines_order_id")
                                .from(OrderLines::Table, OrderLines::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_lines_order_id")
                        .table(OrderLines::Table)
                        .col(OrderLines::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        CustomerId,
        Email,
        Currency,
        SubtotalCents,
        TaxCents,
        ShippingCents,
        TotalCents,
        ShippingName,
        ShippingPhone,
        ShippingAddr1,
        ShippingAddr2,
        ShippingCity,
        ShippingPostal,
        ShippingCountry,
        ProviderSessionId,
        ProviderIntentId,
        CartId,
        PaymentStatus,
        FulfillmentStatus,
        FailureReason,
        Carrier,
        TrackingNumber,
        TrackingUrl,
        ConfirmationEmailSent,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderLines {
        Table,
        Id,
        OrderId,
        VariantId,
        Title,
        Sku,
        Quantity,
        UnitPriceCents,
        TaxRate,
        LineTotalCents,
        TaxCents,
        CreatedAt,
    }
}

mod m20240101_000004_create_refunds_table {

    use super::m20240101_000003_create_order_tables::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_refunds_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Refunds::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Refunds::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Refunds::OrderId).uuid().not_null())
                        .col(
                            ColumnDef::new(Refunds::ProviderRefundId)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Refunds::AmountCents)
                                .big_integer()
                                .not_null()
                                .check(Expr::col(Refunds::AmountCents).gt(0)),
                        )
                        .col(ColumnDef::new(Refunds::Reason).string().null())
                        .col(
                            ColumnDef::new(Refunds::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_refunds_order_id")
                                .from(Refunds::Table, Refunds::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_refunds_provider_refund_id")
                        .table(Refunds::Table)
                        .col(Refunds::ProviderRefundId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_refunds_order_id")
                        .table(Refunds::Table)
                        .col(Refunds::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Refunds::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Refunds {
        Table,
        Id,
        OrderId,
        ProviderRefundId,
        AmountCents,
        Reason,
        CreatedAt,
    }
}

mod m20240101_000005_create_ledger_support_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_ledger_support_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProcessedEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProcessedEvents::Id)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(ProcessedEvents::EventType).string().not_null())
                        .col(
                            ColumnDef::new(ProcessedEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(AuditEntries::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(AuditEntries::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(AuditEntries::EventType).string().not_null())
                        .col(ColumnDef::new(AuditEntries::OrderId).uuid().null())
                        .col(ColumnDef::new(AuditEntries::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(AuditEntries::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_audit_entries_order_id")
                        .table(AuditEntries::Table)
                        .col(AuditEntries::OrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(AuditEntries::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProcessedEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum ProcessedEvents {
        Table,
        Id,
        EventType,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum AuditEntries {
        Table,
        Id,
        EventType,
        OrderId,
        Metadata,
        CreatedAt,
    }
}
