//! Embedded property graph: typed node maps plus adjacency lists, traversed
//! natively per catalog entry.
//!
//! The normal schema reaches products through intermediate `OrderItem` nodes
//! (`(:Order)-[:HAS_ITEM]->(:OrderItem)-[:OF]->(:Product)`). The optimized
//! schema additionally keeps direct `CONTAINS` order→product edges carrying
//! the line data, and a recency index over orders.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use time::OffsetDateTime;

use super::{Backend, BackendError, Execution, ResultSummary};
use crate::catalog::{QueryDefinition, QueryParams};
use crate::dataset::{
    Address, CartItem, Category, Dataset, Order, OrderItem, Product, ProductPurchase,
    ProductView, Review, User,
};
use crate::model::Schema;

const RECENT_WINDOW_SECS: i64 = 30 * 86_400;

#[derive(Clone, Copy, Debug)]
struct Line {
    product_id: i64,
    quantity: i64,
    unit_price: f64,
}

#[derive(Default)]
struct Shortcuts {
    contains: HashMap<i64, Vec<Line>>,
    recency: BTreeSet<(i64, i64)>,
}

#[derive(Default)]
struct GraphStore {
    users: BTreeMap<i64, User>,
    categories: BTreeMap<i64, Category>,
    products: BTreeMap<i64, Product>,
    addresses: BTreeMap<i64, Address>,
    orders: BTreeMap<i64, Order>,
    order_items: BTreeMap<i64, OrderItem>,
    reviews: BTreeMap<i64, Review>,
    cart_items: BTreeMap<i64, CartItem>,
    views: BTreeMap<i64, ProductView>,
    purchases: BTreeMap<i64, ProductPurchase>,
    belongs_to: HashMap<i64, Vec<i64>>,
    in_category: HashMap<i64, Vec<i64>>,
    placed: HashMap<i64, Vec<i64>>,
    has_item: BTreeMap<i64, Vec<i64>>,
    shortcuts: Option<Shortcuts>,
    anchor: i64,
}

/// In-process graph store seeded from a dataset.
pub struct GraphBackend {
    schema: Schema,
    store: RwLock<GraphStore>,
    open: AtomicBool,
}

impl GraphBackend {
    /// Builds nodes and relationships for `schema` from `dataset`.
    pub fn load(schema: Schema, dataset: &Dataset) -> Self {
        Self {
            schema,
            store: RwLock::new(GraphStore::load(schema, dataset)),
            open: AtomicBool::new(false),
        }
    }

    /// Schema flavour of this store.
    pub fn schema(&self) -> Schema {
        self.schema
    }
}

impl Backend for GraphBackend {
    fn connect(&self) -> Result<(), BackendError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn execute(
        &self,
        query: &QueryDefinition,
        params: &QueryParams,
    ) -> Result<Execution, BackendError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(BackendError::Unavailable("graph session is closed".into()));
        }
        let started = Instant::now();
        let id = query.id.get();
        let rows = if query.complexity.is_write() {
            self.store.write().write(id, params)?
        } else {
            self.store.read().read(id)
        };
        Ok(Execution {
            summary: ResultSummary { rows },
            elapsed: started.elapsed(),
        })
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

fn next_id<T>(map: &BTreeMap<i64, T>) -> i64 {
    map.last_key_value().map_or(1, |(id, _)| id + 1)
}

fn required(params: &QueryParams, name: &str) -> Result<i64, BackendError> {
    params
        .int(name)
        .ok_or_else(|| BackendError::QueryExecution(format!("missing parameter {name}")))
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl GraphStore {
    fn load(schema: Schema, data: &Dataset) -> Self {
        let mut store = GraphStore {
            users: data.users.iter().map(|u| (u.id, u.clone())).collect(),
            categories: data.categories.iter().map(|c| (c.id, c.clone())).collect(),
            products: data.products.iter().map(|p| (p.id, p.clone())).collect(),
            addresses: data.addresses.iter().map(|a| (a.id, a.clone())).collect(),
            orders: data.orders.iter().map(|o| (o.id, o.clone())).collect(),
            order_items: data.order_items.iter().map(|i| (i.id, i.clone())).collect(),
            reviews: data.reviews.iter().map(|r| (r.id, r.clone())).collect(),
            cart_items: data.cart_items.iter().map(|c| (c.id, c.clone())).collect(),
            views: data.product_views.iter().map(|v| (v.id, v.clone())).collect(),
            purchases: data.product_purchases.iter().map(|p| (p.id, p.clone())).collect(),
            anchor: data.anchor,
            ..GraphStore::default()
        };
        for pc in &data.product_categories {
            store.belongs_to.entry(pc.product_id).or_default().push(pc.category_id);
            store.in_category.entry(pc.category_id).or_default().push(pc.product_id);
        }
        for order in &data.orders {
            store.placed.entry(order.user_id).or_default().push(order.id);
        }
        for item in &data.order_items {
            store.has_item.entry(item.order_id).or_default().push(item.id);
        }
        if schema == Schema::Optimized {
            let mut shortcuts = Shortcuts::default();
            for item in &data.order_items {
                shortcuts.contains.entry(item.order_id).or_default().push(Line {
                    product_id: item.product_id,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                });
            }
            shortcuts.recency = data.orders.iter().map(|o| (o.created_at, o.id)).collect();
            store.shortcuts = Some(shortcuts);
        }
        store
    }

    fn order_lines(&self, order_id: i64) -> Vec<Line> {
        if let Some(shortcuts) = &self.shortcuts {
            return shortcuts.contains.get(&order_id).cloned().unwrap_or_default();
        }
        self.has_item
            .get(&order_id)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|id| self.order_items.get(id))
                    .map(|item| Line {
                        product_id: item.product_id,
                        quantity: item.quantity,
                        unit_price: item.unit_price,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // Orders that have at least one line, ascending by id.
    fn orders_with_lines(&self) -> Vec<i64> {
        match &self.shortcuts {
            Some(shortcuts) => {
                let mut ids: Vec<i64> = shortcuts
                    .contains
                    .iter()
                    .filter(|(_, lines)| !lines.is_empty())
                    .map(|(id, _)| *id)
                    .collect();
                ids.sort_unstable();
                ids
            }
            None => self
                .has_item
                .iter()
                .filter(|(_, items)| !items.is_empty())
                .map(|(id, _)| *id)
                .collect(),
        }
    }

    fn line_counts(&self) -> HashMap<i64, usize> {
        let mut counts = HashMap::new();
        match &self.shortcuts {
            Some(shortcuts) => {
                for line in shortcuts.contains.values().flatten() {
                    *counts.entry(line.product_id).or_insert(0) += 1;
                }
            }
            None => {
                for item in self.order_items.values() {
                    *counts.entry(item.product_id).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    // Best seller by order lines; ties go to the lowest product id.
    fn top_product(&self) -> Option<i64> {
        self.line_counts()
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(id, _)| id)
    }

    fn orders_containing(&self, product_id: i64) -> Vec<i64> {
        match &self.shortcuts {
            Some(shortcuts) => shortcuts
                .contains
                .iter()
                .filter(|(_, lines)| lines.iter().any(|l| l.product_id == product_id))
                .map(|(order, _)| *order)
                .collect(),
            None => self
                .order_items
                .values()
                .filter(|item| item.product_id == product_id)
                .map(|item| item.order_id)
                .collect(),
        }
    }

    fn recent_orders(&self, limit: usize) -> Vec<i64> {
        if let Some(shortcuts) = &self.shortcuts {
            return shortcuts.recency.iter().rev().take(limit).map(|(_, id)| *id).collect();
        }
        let mut all: Vec<(i64, i64)> = self.orders.values().map(|o| (o.created_at, o.id)).collect();
        all.sort_unstable_by(|a, b| b.cmp(a));
        all.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    fn read(&self, id: u8) -> usize {
        match id {
            1 => self.products.values().take(50_000).count(),
            2 => self.categories.values().take(5_000).count(),
            3 => self.addresses.values().take(1_000).count(),
            4 => self
                .products
                .keys()
                .filter(|id| self.belongs_to.get(id).is_some_and(|c| !c.is_empty()))
                .take(1_000)
                .count(),
            5 => self
                .recent_orders(20)
                .into_iter()
                .flat_map(|order| self.order_lines(order))
                .filter(|line| self.products.contains_key(&line.product_id))
                .take(500)
                .count(),
            6 => {
                let mut latest: Vec<(i64, i64)> =
                    self.reviews.values().map(|r| (r.created_at, r.id)).collect();
                latest.sort_unstable_by(|a, b| b.cmp(a));
                latest.into_iter().take(100).count()
            }
            7 => self.cross_selling(),
            8 => self.co_occurrence(),
            9 => self.category_affinity(),
            10 => self
                .orders_with_lines()
                .into_iter()
                .map(|order| {
                    self.order_lines(order)
                        .iter()
                        .map(|l| l.quantity as f64 * l.unit_price)
                        .sum::<f64>()
                })
                .take(500)
                .count(),
            11 => {
                let mut ratings: BTreeMap<i64, (i64, i64)> = BTreeMap::new();
                for review in self.reviews.values() {
                    let entry = ratings.entry(review.product_id).or_insert((0, 0));
                    entry.0 += review.rating;
                    entry.1 += 1;
                }
                ratings
                    .into_iter()
                    .filter(|(product, _)| self.products.contains_key(product))
                    .filter(|(_, (sum, count))| *sum as f64 / *count as f64 > 4.0)
                    .take(1_000)
                    .count()
            }
            12 => self.recent_buyers(),
            _ => 0,
        }
    }

    fn cross_selling(&self) -> usize {
        let Some(top) = self.top_product() else {
            return 0;
        };
        let buyers: BTreeSet<i64> = self
            .orders_containing(top)
            .into_iter()
            .filter_map(|order| self.orders.get(&order).map(|o| o.user_id))
            .collect();
        let mut bought: HashMap<i64, usize> = HashMap::new();
        for buyer in buyers {
            for order in self.placed.get(&buyer).into_iter().flatten() {
                for line in self.order_lines(*order) {
                    if line.product_id != top {
                        *bought.entry(line.product_id).or_insert(0) += 1;
                    }
                }
            }
        }
        bought.len().min(100)
    }

    fn co_occurrence(&self) -> usize {
        let mut pairs: HashMap<(i64, i64), usize> = HashMap::new();
        for order in self.orders_with_lines() {
            let mut products: Vec<i64> = self
                .order_lines(order)
                .into_iter()
                .map(|l| l.product_id)
                .collect();
            products.sort_unstable();
            products.dedup();
            for (i, a) in products.iter().enumerate() {
                for b in &products[i + 1..] {
                    *pairs.entry((*a, *b)).or_insert(0) += 1;
                }
            }
        }
        pairs.len().min(100)
    }

    fn category_affinity(&self) -> usize {
        let Some(top) = self.top_product() else {
            return 0;
        };
        let related: BTreeSet<i64> = self
            .belongs_to
            .get(&top)
            .into_iter()
            .flatten()
            .filter_map(|category| self.in_category.get(category))
            .flatten()
            .copied()
            .filter(|product| *product != top)
            .collect();
        let counts = self.line_counts();
        let mut ranked: Vec<(usize, i64)> = related
            .iter()
            .map(|product| (counts.get(product).copied().unwrap_or(0), *product))
            .collect();
        ranked.sort_unstable_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked.into_iter().take(100).count()
    }

    fn recent_buyers(&self) -> usize {
        let cutoff = self.anchor - RECENT_WINDOW_SECS;
        let users: BTreeSet<i64> = match &self.shortcuts {
            Some(shortcuts) => shortcuts
                .recency
                .range((cutoff, i64::MIN)..)
                .filter_map(|(_, id)| self.orders.get(id).map(|o| o.user_id))
                .collect(),
            None => self
                .orders
                .values()
                .filter(|o| o.created_at >= cutoff)
                .map(|o| o.user_id)
                .collect(),
        };
        users.len().min(500)
    }

    fn write(&mut self, id: u8, params: &QueryParams) -> Result<usize, BackendError> {
        let rows = match id {
            13 => {
                let user_id = required(params, ":user_id")?;
                let street = params
                    .text(":street")
                    .ok_or_else(|| BackendError::QueryExecution("missing parameter :street".into()))?;
                let id = next_id(&self.addresses);
                self.addresses.insert(
                    id,
                    Address {
                        id,
                        user_id,
                        street: street.to_string(),
                        city: "Benchtown".into(),
                        zip: "00000".into(),
                    },
                );
                1
            }
            14 => {
                let user_id = required(params, ":user_id")?;
                let id = next_id(&self.orders);
                let created_at = now();
                self.orders.insert(
                    id,
                    Order {
                        id,
                        user_id,
                        created_at,
                        status: "new".into(),
                    },
                );
                self.placed.entry(user_id).or_default().push(id);
                if let Some(shortcuts) = &mut self.shortcuts {
                    shortcuts.recency.insert((created_at, id));
                }
                1
            }
            15 => {
                let user_id = required(params, ":user_id")?;
                let product_id = required(params, ":product_id")?;
                let id = next_id(&self.cart_items);
                self.cart_items.insert(
                    id,
                    CartItem {
                        id,
                        user_id,
                        product_id,
                        quantity: 1,
                        added_at: now(),
                    },
                );
                1
            }
            16 => {
                let user_id = required(params, ":user_id")?;
                let product_id = required(params, ":product_id")?;
                let id = next_id(&self.views);
                self.views.insert(
                    id,
                    ProductView {
                        id,
                        user_id,
                        product_id,
                        viewed_at: now(),
                    },
                );
                1
            }
            17 => {
                let product_id = required(params, ":product_id")?;
                match self.products.get_mut(&product_id) {
                    Some(product) => {
                        product.stock += 1;
                        1
                    }
                    None => 0,
                }
            }
            18 => {
                let pivot = required(params, ":review_pivot")?;
                match self.reviews.range_mut(pivot..).next() {
                    Some((_, review)) => {
                        review.rating = (review.rating - 1).max(1);
                        1
                    }
                    None => 0,
                }
            }
            19 => {
                let pivot = required(params, ":cart_pivot")?;
                match self.cart_items.range_mut(pivot..).next() {
                    Some((_, item)) => {
                        item.quantity += 3;
                        1
                    }
                    None => 0,
                }
            }
            20 => {
                let user_id = required(params, ":user_id")?;
                match self.users.get_mut(&user_id) {
                    Some(user) => {
                        user.email.push_str(".tmp");
                        1
                    }
                    None => 0,
                }
            }
            21 => usize::from(self.addresses.pop_first().is_some()),
            22 => usize::from(self.reviews.pop_first().is_some()),
            23 => usize::from(self.cart_items.pop_first().is_some()),
            24 => usize::from(self.purchases.pop_first().is_some()),
            other => {
                return Err(BackendError::QueryExecution(format!(
                    "query {other} is not a write"
                )))
            }
        };
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{lookup, ParamKey};
    use crate::model::{QueryId, Scale, Variant};

    fn dataset() -> Dataset {
        Dataset::generate_at(80, 5, 1_760_000_000)
    }

    fn query(id: u8) -> &'static QueryDefinition {
        lookup(QueryId::new(id).unwrap())
    }

    fn run(backend: &GraphBackend, id: u8) -> usize {
        backend.execute(query(id), &QueryParams::empty()).unwrap().summary.rows
    }

    #[test]
    fn both_schemas_answer_reads_identically() {
        let data = dataset();
        let normal = GraphBackend::load(Schema::Normal, &data);
        let optimized = GraphBackend::load(Schema::Optimized, &data);
        normal.connect().unwrap();
        optimized.connect().unwrap();
        for id in 1..=12 {
            assert_eq!(run(&normal, id), run(&optimized, id), "query {id}");
        }
        assert_eq!(run(&normal, 1), data.products.len());
        assert_eq!(run(&normal, 6), data.reviews.len().min(100));
    }

    #[test]
    fn recency_window_ends_at_the_dataset_anchor() {
        // anchored years in the past: a wall-clock window would see no orders
        let data = Dataset::generate_at(200, 8, 1_500_000_000);
        let cutoff = data.anchor - RECENT_WINDOW_SECS;
        let expected: BTreeSet<i64> = data
            .orders
            .iter()
            .filter(|o| o.created_at >= cutoff)
            .map(|o| o.user_id)
            .collect();
        assert!(!expected.is_empty());
        for schema in [Schema::Normal, Schema::Optimized] {
            let backend = GraphBackend::load(schema, &data);
            backend.connect().unwrap();
            assert_eq!(run(&backend, 12), expected.len().min(500), "{schema:?}");
        }
    }

    #[test]
    fn recent_orders_follow_recency() {
        let data = dataset();
        let normal = GraphStore::load(Schema::Normal, &data);
        let optimized = GraphStore::load(Schema::Optimized, &data);
        assert_eq!(normal.recent_orders(20), optimized.recent_orders(20));
        let newest = data.orders.iter().max_by_key(|o| (o.created_at, o.id)).unwrap();
        assert_eq!(normal.recent_orders(1), vec![newest.id]);
    }

    #[test]
    fn writes_touch_one_row_and_deletes_drain() {
        let data = dataset();
        let backend = GraphBackend::load(Schema::Optimized, &data);
        backend.connect().unwrap();
        for id in 13..=20u8 {
            let def = query(id);
            let params = def.bind(
                ParamKey {
                    seed: 7,
                    scale: Scale::Users1k,
                    variant: Variant::GraphOptimized,
                    query_id: def.id,
                    repetition: 1,
                },
                &data.bounds(),
            );
            let exec = backend.execute(def, &params).unwrap();
            assert_eq!(exec.summary.rows, 1, "query {id}");
        }
        let before = run(&backend, 3);
        assert_eq!(run(&backend, 21), 1);
        assert_eq!(run(&backend, 3), before - 1);
        // query 14 placed an order just now
        assert!(run(&backend, 12) >= 1);
    }

    #[test]
    fn missing_parameters_fail_the_call() {
        let backend = GraphBackend::load(Schema::Normal, &dataset());
        backend.connect().unwrap();
        let err = backend.execute(query(17), &QueryParams::empty()).unwrap_err();
        assert!(matches!(err, BackendError::QueryExecution(_)));
    }

    #[test]
    fn empty_tables_yield_zero_rows() {
        let backend = GraphBackend::load(Schema::Normal, &Dataset::default());
        backend.connect().unwrap();
        assert_eq!(run(&backend, 24), 0);
        assert_eq!(run(&backend, 7), 0);
    }

    #[test]
    fn closed_session_is_unavailable() {
        let backend = GraphBackend::load(Schema::Normal, &dataset());
        assert!(backend.execute(query(1), &QueryParams::empty()).unwrap_err().is_unavailable());
        backend.connect().unwrap();
        assert_eq!(run(&backend, 2), 8);
        backend.close();
        assert!(backend.execute(query(2), &QueryParams::empty()).unwrap_err().is_unavailable());
    }
}
