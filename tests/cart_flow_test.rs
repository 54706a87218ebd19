//! Cart store and reconciliation tests: line-identity merging, quantity
//! semantics, derived totals, and the one-time guest-to-customer merge.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use rust_decimal_macros::dec;
use uuid::Uuid;

use terracotta_api::{
    entities::CartStatus,
    errors::ServiceError,
    services::carts::{AddItemInput, CreateCartInput},
};

fn add(product_id: Uuid, color: Option<&str>, quantity: i32) -> AddItemInput {
    AddItemInput {
        product_id,
        color: color.map(str::to_string),
        attributes: None,
        quantity: Some(quantity),
    }
}

#[tokio::test]
async fn test_adding_same_product_and_color_merges_into_one_line() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let cart = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-1".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();

    app.services
        .carts
        .add_item(cart.id, add(product.id, None, 1))
        .await
        .unwrap();
    let with_items = app
        .services
        .carts
        .add_item(cart.id, add(product.id, None, 2))
        .await
        .unwrap();

    assert_eq!(with_items.items.len(), 1);
    assert_eq!(with_items.items[0].quantity, 3);
}

#[tokio::test]
async fn test_different_colors_stay_separate_lines() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let cart = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-1".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();

    app.services
        .carts
        .add_item(cart.id, add(product.id, Some("azure"), 1))
        .await
        .unwrap();
    let with_items = app
        .services
        .carts
        .add_item(cart.id, add(product.id, Some("sand"), 1))
        .await
        .unwrap();

    assert_eq!(with_items.items.len(), 2);
}

#[tokio::test]
async fn test_nonpositive_quantity_removes_line() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let cart = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-1".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();

    let with_items = app
        .services
        .carts
        .add_item(cart.id, add(product.id, None, 2))
        .await
        .unwrap();
    let item_id = with_items.items[0].id;

    for quantity in [0, -3] {
        let result = app
            .services
            .carts
            .set_item_quantity(cart.id, item_id, quantity)
            .await;
        match result {
            Ok(with_items) => assert!(with_items.items.is_empty()),
            // Second pass: the line is already gone.
            Err(err) => assert_matches!(err, ServiceError::NotFound(_)),
        }
    }
}

#[tokio::test]
async fn test_totals_derive_weight_count_and_prep_days() {
    let app = TestApp::new().await;
    let bowl = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let vase = app.seed_product("Raku vase", dec!(250000), 1200, 5).await;
    let cart = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-1".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();

    app.services
        .carts
        .add_item(cart.id, add(bowl.id, None, 2))
        .await
        .unwrap();
    app.services
        .carts
        .add_item(cart.id, add(vase.id, None, 1))
        .await
        .unwrap();

    let totals = app.services.carts.totals(cart.id).await.unwrap();
    assert_eq!(totals.subtotal, dec!(450000));
    assert_eq!(totals.item_count, 3);
    assert_eq!(totals.total_weight_grams, 2 * 500 + 1200);
    assert_eq!(totals.max_prep_days, 2);
}

#[tokio::test]
async fn test_empty_cart_totals_are_zero() {
    let app = TestApp::new().await;
    let cart = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-1".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();

    let totals = app.services.carts.totals(cart.id).await.unwrap();
    assert_eq!(totals.item_count, 0);
    assert_eq!(totals.max_prep_days, 0);
    assert_eq!(totals.subtotal, dec!(0));
}

#[tokio::test]
async fn test_merge_sums_quantities_for_shared_keys() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let customer_id = Uuid::new_v4();

    let guest = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-merge".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();
    app.services
        .carts
        .add_item(guest.id, add(product.id, None, 2))
        .await
        .unwrap();

    let remote = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: None,
            customer_id: Some(customer_id),
        })
        .await
        .unwrap();
    app.services
        .carts
        .add_item(remote.id, add(product.id, None, 3))
        .await
        .unwrap();

    let merged = app
        .services
        .reconciler
        .merge_on_login("sess-merge", customer_id)
        .await
        .unwrap();

    assert_eq!(merged.cart.id, remote.id);
    assert_eq!(merged.items.len(), 1);
    assert_eq!(merged.items[0].quantity, 5);

    // The guest cart is retired; nothing is left to merge again.
    let guest_after = app.services.carts.get_cart(guest.id).await.unwrap();
    assert_eq!(guest_after.cart.status, CartStatus::Merged);
    assert!(guest_after.items.is_empty());
}

#[tokio::test]
async fn test_merge_keeps_one_sided_lines() {
    let app = TestApp::new().await;
    let bowl = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let vase = app.seed_product("Raku vase", dec!(250000), 1200, 5).await;
    let customer_id = Uuid::new_v4();

    let guest = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-merge".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();
    app.services
        .carts
        .add_item(guest.id, add(bowl.id, None, 2))
        .await
        .unwrap();

    let remote = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: None,
            customer_id: Some(customer_id),
        })
        .await
        .unwrap();
    app.services
        .carts
        .add_item(remote.id, add(vase.id, None, 1))
        .await
        .unwrap();

    let merged = app
        .services
        .reconciler
        .merge_on_login("sess-merge", customer_id)
        .await
        .unwrap();

    assert_eq!(merged.items.len(), 2);
    let quantities: Vec<i32> = merged.items.iter().map(|i| i.quantity).collect();
    assert!(quantities.contains(&2));
    assert!(quantities.contains(&1));
}

#[tokio::test]
async fn test_merge_promotes_guest_cart_when_no_remote_cart() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let customer_id = Uuid::new_v4();

    let guest = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-solo".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();
    app.services
        .carts
        .add_item(guest.id, add(product.id, None, 2))
        .await
        .unwrap();

    let merged = app
        .services
        .reconciler
        .merge_on_login("sess-solo", customer_id)
        .await
        .unwrap();

    // The guest cart itself became the customer's remote cart.
    assert_eq!(merged.cart.id, guest.id);
    assert_eq!(merged.cart.customer_id, Some(customer_id));
    assert_eq!(merged.cart.session_id, None);
    assert_eq!(merged.items.len(), 1);
}

#[tokio::test]
async fn test_merge_runs_exactly_once_per_login() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let customer_id = Uuid::new_v4();

    let guest = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: Some("sess-once".to_string()),
            customer_id: None,
        })
        .await
        .unwrap();
    app.services
        .carts
        .add_item(guest.id, add(product.id, None, 2))
        .await
        .unwrap();

    let remote = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: None,
            customer_id: Some(customer_id),
        })
        .await
        .unwrap();
    app.services
        .carts
        .add_item(remote.id, add(product.id, None, 3))
        .await
        .unwrap();

    let first = app
        .services
        .reconciler
        .merge_on_login("sess-once", customer_id)
        .await
        .unwrap();
    let second = app
        .services
        .reconciler
        .merge_on_login("sess-once", customer_id)
        .await
        .unwrap();

    // Re-running the login transition must not double the quantities.
    assert_eq!(first.items[0].quantity, 5);
    assert_eq!(second.items[0].quantity, 5);
}

#[tokio::test]
async fn test_merge_with_no_guest_cart_keeps_remote_as_truth() {
    let app = TestApp::new().await;
    let product = app.seed_product("Glazed bowl", dec!(100000), 500, 10).await;
    let customer_id = Uuid::new_v4();

    let remote = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: None,
            customer_id: Some(customer_id),
        })
        .await
        .unwrap();
    app.services
        .carts
        .add_item(remote.id, add(product.id, None, 3))
        .await
        .unwrap();

    let merged = app
        .services
        .reconciler
        .merge_on_login("sess-unknown", customer_id)
        .await
        .unwrap();

    assert_eq!(merged.cart.id, remote.id);
    assert_eq!(merged.items.len(), 1);
    assert_eq!(merged.items[0].quantity, 3);
}

#[tokio::test]
async fn test_cart_requires_an_owner() {
    let app = TestApp::new().await;
    let err = app
        .services
        .carts
        .create_cart(CreateCartInput {
            session_id: None,
            customer_id: None,
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));
}
