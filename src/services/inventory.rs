use crate::{
    entities::{
        inventory_movement, product, InventoryMovement, Product,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::settlement::LineSnapshot,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const MOVEMENT_SALE: &str = "sale";

/// Append-only inventory movement sink.
///
/// The settlement flow feeds it the settled cart snapshot; one `sale`
/// movement is written per product per settled transaction. A movement that
/// already exists for `(product, sale, reference)` is skipped, so retrying
/// after a crash never decrements stock twice.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Records the stock decrement for a settled transaction.
    #[instrument(skip(self, lines), fields(reference_id = %reference_id))]
    pub async fn record_sale(
        &self,
        reference_id: Uuid,
        lines: &[LineSnapshot],
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let mut recorded: Vec<(Uuid, i32)> = Vec::new();

        for line in lines {
            let existing = InventoryMovement::find()
                .filter(inventory_movement::Column::ProductId.eq(line.product_id))
                .filter(inventory_movement::Column::MovementType.eq(MOVEMENT_SALE))
                .filter(inventory_movement::Column::ReferenceId.eq(reference_id))
                .one(&txn)
                .await?;
            if existing.is_some() {
                continue;
            }

            let movement = inventory_movement::ActiveModel {
                id: Set(Uuid::new_v4()),
                product_id: Set(line.product_id),
                quantity_delta: Set(-line.quantity),
                movement_type: Set(MOVEMENT_SALE.to_string()),
                reference_id: Set(reference_id),
                created_at: Set(Utc::now()),
            };
            movement.insert(&txn).await?;

            if let Some(product_row) = Product::find_by_id(line.product_id).one(&txn).await? {
                let remaining = product_row.stock - line.quantity;
                if remaining < 0 {
                    warn!(
                        product_id = %line.product_id,
                        "stock went negative on settlement; clamping to zero"
                    );
                }
                let mut active: product::ActiveModel = product_row.into();
                active.stock = Set(remaining.max(0));
                active.updated_at = Set(Utc::now());
                active.update(&txn).await?;
            }

            recorded.push((line.product_id, line.quantity));
        }

        txn.commit().await?;

        for (product_id, quantity) in recorded {
            self.event_sender
                .send_or_log(Event::StockDecremented {
                    product_id,
                    quantity,
                    reference_id,
                })
                .await;
        }

        info!(%reference_id, "recorded sale movements");
        Ok(())
    }

    /// Movements recorded against a reference (settlement) id.
    pub async fn movements_for_reference(
        &self,
        reference_id: Uuid,
    ) -> Result<Vec<inventory_movement::Model>, ServiceError> {
        Ok(InventoryMovement::find()
            .filter(inventory_movement::Column::ReferenceId.eq(reference_id))
            .all(&*self.db)
            .await?)
    }
}
