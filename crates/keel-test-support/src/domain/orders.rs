//! Products and orders.

use std::collections::BTreeMap;

use keel_core::aggregate::{AggregateCore, AggregateRoot, Transitions};
use keel_core::error::DomainError;
use keel_core::event::DomainEvent;
use keel_core::types::TypeNameRegistry;
use serde::{Deserialize, Serialize};

/// A product was listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductCreated {
    /// Id of the product.
    pub product_id: String,
    /// Display name.
    pub name: String,
    /// Unit price.
    pub price: i64,
}
impl DomainEvent for ProductCreated {}

/// An order was opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreated {
    /// Id of the order.
    pub order_id: String,
}
impl DomainEvent for OrderCreated {}

/// A line was added to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemAdded {
    /// Ordered product.
    pub product_id: String,
    /// Unit price at the time of ordering.
    pub unit_price: i64,
    /// Ordered quantity.
    pub quantity: u32,
}
impl DomainEvent for OrderItemAdded {}

/// The quantity of an order line changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemQuantityChanged {
    /// Ordered product.
    pub product_id: String,
    /// New quantity.
    pub quantity: u32,
}
impl DomainEvent for OrderItemQuantityChanged {}

/// A line was removed from an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemRemoved {
    /// Removed product.
    pub product_id: String,
}
impl DomainEvent for OrderItemRemoved {}

/// A sellable product. Its state is copied field by field from
/// [`ProductCreated`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Product {
    #[serde(skip)]
    core: AggregateCore,
    name: String,
    price: i64,
}

impl Product {
    /// Lists a product.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a negative price.
    pub fn create(id: &str, name: &str, price: i64) -> Result<Self, DomainError> {
        if price < 0 {
            return Err(DomainError::Validation(format!("negative price {price}")));
        }
        let mut product = Self {
            core: AggregateCore::new(id),
            ..Self::default()
        };
        product.on_event(ProductCreated {
            product_id: id.to_owned(),
            name: name.to_owned(),
            price,
        })?;
        Ok(product)
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit price.
    #[must_use]
    pub fn price(&self) -> i64 {
        self.price
    }
}

impl AggregateRoot for Product {
    fn core(&self) -> &AggregateCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregateCore {
        &mut self.core
    }

    fn register_transitions(transitions: &mut Transitions<Self>) {
        transitions.copy_fields::<ProductCreated>();
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    /// Ordered product.
    pub product_id: String,
    /// Unit price at the time of ordering.
    pub unit_price: i64,
    /// Ordered quantity.
    pub quantity: u32,
}

impl OrderItem {
    /// Price of the line.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.unit_price * i64::from(self.quantity)
    }
}

/// A customer order.
#[derive(Debug, Default)]
pub struct Order {
    core: AggregateCore,
    items: BTreeMap<String, OrderItem>,
}

impl Order {
    /// Opens an empty order.
    ///
    /// # Errors
    ///
    /// Propagates errors from raising the creation event.
    pub fn create(id: &str) -> Result<Self, DomainError> {
        let mut order = Self {
            core: AggregateCore::new(id),
            ..Self::default()
        };
        order.on_event(OrderCreated {
            order_id: id.to_owned(),
        })?;
        Ok(order)
    }

    /// Adds `quantity` units of `product`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a zero quantity or a product
    /// already on the order.
    pub fn add_item(&mut self, product: &Product, quantity: u32) -> Result<(), DomainError> {
        let product_id = product.id().unwrap_or_default().to_owned();
        if quantity == 0 {
            return Err(DomainError::Validation("quantity must be positive".into()));
        }
        if self.items.contains_key(&product_id) {
            return Err(DomainError::Validation(format!("{product_id} is already ordered")));
        }
        self.on_event(OrderItemAdded {
            product_id,
            unit_price: product.price(),
            quantity,
        })
    }

    /// Changes the quantity of an ordered product.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a zero quantity or a product not
    /// on the order.
    pub fn update_item(&mut self, product_id: &str, quantity: u32) -> Result<(), DomainError> {
        if quantity == 0 {
            return Err(DomainError::Validation("quantity must be positive".into()));
        }
        self.ensure_ordered(product_id)?;
        self.on_event(OrderItemQuantityChanged {
            product_id: product_id.to_owned(),
            quantity,
        })
    }

    /// Removes an ordered product.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a product not on the order.
    pub fn remove_item(&mut self, product_id: &str) -> Result<(), DomainError> {
        self.ensure_ordered(product_id)?;
        self.on_event(OrderItemRemoved {
            product_id: product_id.to_owned(),
        })
    }

    /// Lines of the order, keyed by product id.
    #[must_use]
    pub fn items(&self) -> &BTreeMap<String, OrderItem> {
        &self.items
    }

    /// The line for `product_id`, if ordered.
    #[must_use]
    pub fn item(&self, product_id: &str) -> Option<&OrderItem> {
        self.items.get(product_id)
    }

    /// Sum of all line totals.
    #[must_use]
    pub fn total_price(&self) -> i64 {
        self.items.values().map(OrderItem::total).sum()
    }

    fn ensure_ordered(&self, product_id: &str) -> Result<(), DomainError> {
        if self.items.contains_key(product_id) {
            Ok(())
        } else {
            Err(DomainError::Validation(format!("{product_id} is not on the order")))
        }
    }
}

impl AggregateRoot for Order {
    fn core(&self) -> &AggregateCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut AggregateCore {
        &mut self.core
    }

    fn register_transitions(transitions: &mut Transitions<Self>) {
        transitions
            .on(|order: &mut Self, event: &OrderItemAdded| {
                order.items.insert(
                    event.product_id.clone(),
                    OrderItem {
                        product_id: event.product_id.clone(),
                        unit_price: event.unit_price,
                        quantity: event.quantity,
                    },
                );
            })
            .on(|order: &mut Self, event: &OrderItemQuantityChanged| {
                if let Some(item) = order.items.get_mut(&event.product_id) {
                    item.quantity = event.quantity;
                }
            })
            .on(|order: &mut Self, event: &OrderItemRemoved| {
                order.items.remove(&event.product_id);
            });
    }
}

/// Registers the order model's names.
///
/// # Errors
///
/// Returns a type-name error if any name is already taken.
pub fn register(types: &mut TypeNameRegistry) -> Result<(), DomainError> {
    types
        .register_aggregate::<Product>("shop.product")?
        .register_aggregate::<Order>("shop.order")?
        .register_event::<ProductCreated>("shop.product-created")?
        .register_event::<OrderCreated>("shop.order-created")?
        .register_event::<OrderItemAdded>("shop.order-item-added")?
        .register_event::<OrderItemQuantityChanged>("shop.order-item-quantity-changed")?
        .register_event::<OrderItemRemoved>("shop.order-item-removed")?;
    Ok(())
}
