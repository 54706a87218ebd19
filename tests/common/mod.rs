//! Shared harness for integration tests: an in-memory SQLite database with
//! migrations applied, the full service graph, and a scripted payment
//! gateway whose behavior each test controls.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, DatabaseConnection, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

use terracotta_api::{
    config::AppConfig,
    entities::{coupon, product, CouponModel, CouponType, ProductModel},
    events::EventSender,
    gateway::{GatewayError, PaymentGateway, PaymentHandle, PaymentRequest, VerifyOutcome,
        VerifyRequest},
    handlers::AppServices,
    migrator,
};

#[derive(Debug, Clone, Copy)]
pub enum RequestBehavior {
    Succeed,
    Unreachable,
}

#[derive(Debug, Clone, Copy)]
pub enum VerifyBehavior {
    Confirm,
    Decline,
    Unreachable,
}

/// Scripted in-process gateway double.
pub struct TestGateway {
    pub request_behavior: Mutex<RequestBehavior>,
    pub verify_behavior: Mutex<VerifyBehavior>,
    pub request_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
}

impl TestGateway {
    pub fn new() -> Self {
        Self {
            request_behavior: Mutex::new(RequestBehavior::Succeed),
            verify_behavior: Mutex::new(VerifyBehavior::Confirm),
            request_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_request_behavior(&self, behavior: RequestBehavior) {
        *self.request_behavior.lock().unwrap() = behavior;
    }

    pub fn set_verify_behavior(&self, behavior: VerifyBehavior) {
        *self.verify_behavior.lock().unwrap() = behavior;
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for TestGateway {
    async fn request_payment(
        &self,
        _request: PaymentRequest,
    ) -> Result<PaymentHandle, GatewayError> {
        let call = self.request_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match *self.request_behavior.lock().unwrap() {
            RequestBehavior::Succeed => Ok(PaymentHandle {
                authority: format!("A-TEST-{}", call),
                redirect_url: format!("https://pay.test/start/A-TEST-{}", call),
            }),
            RequestBehavior::Unreachable => {
                Err(GatewayError::Transport("connection refused".to_string()))
            }
        }
    }

    async fn verify_payment(
        &self,
        _request: VerifyRequest,
    ) -> Result<VerifyOutcome, GatewayError> {
        let call = self.verify_calls.fetch_add(1, Ordering::SeqCst) + 1;
        match *self.verify_behavior.lock().unwrap() {
            VerifyBehavior::Confirm => Ok(VerifyOutcome {
                reference_id: format!("REF-{}", call),
            }),
            VerifyBehavior::Decline => {
                Err(GatewayError::Declined("insufficient funds".to_string()))
            }
            VerifyBehavior::Unreachable => {
                Err(GatewayError::Transport("connection reset".to_string()))
            }
        }
    }
}

pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub event_sender: EventSender,
    pub services: AppServices,
    pub gateway: Arc<TestGateway>,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut options = ConnectOptions::new("sqlite::memory:".to_string());
        options.max_connections(1).min_connections(1);
        let db = Database::connect(options)
            .await
            .expect("in-memory sqlite connects");

        use sea_orm_migration::MigratorTrait;
        migrator::Migrator::up(&db, None)
            .await
            .expect("migrations apply");

        let config: AppConfig =
            serde_json::from_value(serde_json::json!({ "database_url": "sqlite::memory:" }))
                .expect("test config deserializes");

        let (tx, mut rx) = mpsc::channel(256);
        // Drain events so senders never block.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let event_sender = EventSender::new(tx);

        let db = Arc::new(db);
        let gateway = Arc::new(TestGateway::new());
        let services = AppServices::new(
            db.clone(),
            Arc::new(event_sender.clone()),
            gateway.clone(),
            Arc::new(config.clone()),
        );

        Self {
            db,
            config,
            event_sender,
            services,
            gateway,
        }
    }

    /// Inserts a catalog product.
    pub async fn seed_product(
        &self,
        name: &str,
        unit_price: Decimal,
        weight_grams: i32,
        stock: i32,
    ) -> ProductModel {
        let row = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            unit_price: Set(unit_price),
            weight_grams: Set(weight_grams),
            prep_days: Set(2),
            stock: Set(stock),
            is_active: Set(true),
            image_url: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };
        row.insert(&*self.db).await.expect("product inserts")
    }

    /// Inserts a percentage coupon.
    pub async fn seed_percentage_coupon(
        &self,
        code: &str,
        value: Decimal,
        min_purchase: Decimal,
        max_discount: Option<Decimal>,
    ) -> CouponModel {
        let row = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            discount_type: Set(CouponType::Percentage),
            discount_value: Set(value),
            min_purchase: Set(min_purchase),
            max_discount: Set(max_discount),
            usage_limit: Set(Some(10)),
            used_count: Set(0),
            is_active: Set(true),
            expires_at: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };
        row.insert(&*self.db).await.expect("coupon inserts")
    }
}

/// A well-formed destination in the courier-enabled city.
pub fn destination(city: &str) -> terracotta_api::services::settlement::Destination {
    terracotta_api::services::settlement::Destination {
        recipient: "Mina Kazemi".to_string(),
        phone: "09123456789".to_string(),
        address_line: "12 Kiln Street".to_string(),
        city: city.to_string(),
        postal_code: "97201".to_string(),
    }
}
