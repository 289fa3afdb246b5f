//! Post-commit notification hooks for marketplace writes.
//!
//! Handlers commit the marketplace change first and only then hand the
//! resulting [`MarketEvent`] to [`publish`], so a notification problem can
//! never roll back a sale.

use serde_json::{json, Map, Value};

use crate::app::notifier::Notifier;
use crate::domain::notification::{FanOutReport, PushMessage};

#[derive(Debug, Clone)]
pub enum MarketEvent {
    AddedToCart {
        item_id: i64,
        title: String,
        seller_id: i64,
        shopper_id: i64,
    },
    ItemSold {
        item_id: i64,
        title: String,
        seller_id: i64,
        buyer_id: i64,
        cart_holders: Vec<i64>,
    },
    ItemWithdrawn {
        item_id: i64,
        title: String,
        seller_id: i64,
        cart_holders: Vec<i64>,
    },
}

/// One audience and the message it receives.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub audience: Vec<i64>,
    pub message: PushMessage,
}

impl MarketEvent {
    /// Audiences never include the user who caused the event.
    pub fn dispatches(&self) -> Vec<Dispatch> {
        match self {
            MarketEvent::AddedToCart {
                item_id,
                title,
                seller_id,
                shopper_id,
            } => {
                if seller_id == shopper_id {
                    return Vec::new();
                }
                vec![Dispatch {
                    audience: vec![*seller_id],
                    message: PushMessage::new(
                        "Someone wants your item",
                        format!("\"{}\" was added to a cart", title),
                    )
                    .with_data(payload("added_to_cart", *item_id)),
                }]
            }
            MarketEvent::ItemSold {
                item_id,
                title,
                seller_id,
                buyer_id,
                cart_holders,
            } => {
                let mut dispatches = vec![Dispatch {
                    audience: vec![*seller_id],
                    message: PushMessage::new("Item sold", format!("\"{}\" has been sold", title))
                        .with_data(payload("item_sold", *item_id)),
                }];

                let others = excluding(cart_holders, &[*buyer_id, *seller_id]);
                if !others.is_empty() {
                    dispatches.push(Dispatch {
                        audience: others,
                        message: PushMessage::new(
                            "Item no longer available",
                            format!("\"{}\" in your cart was bought by someone else", title),
                        )
                        .with_data(payload("item_unavailable", *item_id)),
                    });
                }
                dispatches
            }
            MarketEvent::ItemWithdrawn {
                item_id,
                title,
                seller_id,
                cart_holders,
            } => {
                let audience = excluding(cart_holders, &[*seller_id]);
                if audience.is_empty() {
                    return Vec::new();
                }
                vec![Dispatch {
                    audience,
                    message: PushMessage::new(
                        "Item removed",
                        format!("\"{}\" was removed by the seller", title),
                    )
                    .with_data(payload("item_withdrawn", *item_id)),
                }]
            }
        }
    }
}

/// Runs every dispatch for `event`. Failures are logged, not returned: the
/// marketplace write has already committed.
pub async fn publish(notifier: &Notifier, event: MarketEvent) -> Vec<FanOutReport> {
    let mut reports = Vec::new();
    for dispatch in event.dispatches() {
        match notifier.notify(&dispatch.audience, &dispatch.message).await {
            Ok(report) => reports.push(report),
            Err(err) => {
                tracing::error!(
                    error = ?err,
                    event = ?event,
                    "failed to fan out marketplace notification"
                );
            }
        }
    }
    reports
}

fn payload(kind: &str, item_id: i64) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("type".into(), json!(kind));
    data.insert("item_id".into(), json!(item_id));
    data
}

fn excluding(ids: &[i64], excluded: &[i64]) -> Vec<i64> {
    ids.iter()
        .copied()
        .filter(|id| !excluded.contains(id))
        .collect()
}
