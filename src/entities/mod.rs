/// Entity modules for the storefront core.
pub mod cart;
pub mod cart_item;
pub mod coupon;
pub mod inventory_movement;
pub mod order;
pub mod order_item;
pub mod product;
pub mod settlement;

// Re-export entities
pub use cart::{CartStatus, Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use coupon::{CouponType, Entity as Coupon, Model as CouponModel};
pub use inventory_movement::{Entity as InventoryMovement, Model as InventoryMovementModel};
pub use order::{Entity as Order, Model as OrderModel};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use product::{Entity as Product, Model as ProductModel};
pub use settlement::{Entity as Settlement, Model as SettlementModel, SettlementStatus};
