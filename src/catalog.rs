//! The fixed registry of the 24 e-commerce benchmark operations.
//!
//! Each entry carries its SQL text for the relational backend; the graph
//! backend dispatches on the query id to a native traversal. Write entries
//! bind named parameters drawn from a per-repetition seeded RNG so that
//! re-running a sweep with the same seed replays the same arguments.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use xxhash_rust::xxh64::xxh64;

use crate::model::{Complexity, QueryId, Scale, Variant};

/// Parameters a catalog entry needs bound before execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamSpec {
    /// Parameter-free read or delete.
    None,
    /// `:user_id`.
    User,
    /// `:user_id`, `:street`.
    UserStreet,
    /// `:user_id`, `:product_id`.
    UserProduct,
    /// `:product_id`.
    Product,
    /// `:review_pivot`.
    ReviewPivot,
    /// `:cart_pivot`.
    CartPivot,
}

impl ParamSpec {
    /// Named parameters in binding order.
    pub fn names(self) -> &'static [&'static str] {
        match self {
            ParamSpec::None => &[],
            ParamSpec::User => &[":user_id"],
            ParamSpec::UserStreet => &[":user_id", ":street"],
            ParamSpec::UserProduct => &[":user_id", ":product_id"],
            ParamSpec::Product => &[":product_id"],
            ParamSpec::ReviewPivot => &[":review_pivot"],
            ParamSpec::CartPivot => &[":cart_pivot"],
        }
    }
}

/// One immutable catalog entry.
#[derive(Debug)]
pub struct QueryDefinition {
    /// Catalog id.
    pub id: QueryId,
    /// Reporting class.
    pub complexity: Complexity,
    /// Short human-readable name.
    pub name: &'static str,
    /// Statement text for the relational backend.
    pub sql: &'static str,
    /// Parameters bound per repetition.
    pub params: ParamSpec,
}

/// A bound parameter value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamValue {
    /// Integer id or pivot.
    Int(i64),
    /// Text value.
    Text(String),
}

/// Named parameters bound for a single call. Names carry the `:` prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    values: Vec<(&'static str, ParamValue)>,
}

impl QueryParams {
    /// Empty parameter set.
    pub fn empty() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &'static str, value: ParamValue) {
        self.values.push((name, value));
    }

    /// All bound values in binding order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ParamValue)> + '_ {
        self.values.iter().map(|(name, value)| (*name, value))
    }

    /// Looks up an integer parameter by name.
    pub fn int(&self, name: &str) -> Option<i64> {
        self.values.iter().find_map(|(n, v)| match v {
            ParamValue::Int(value) if *n == name => Some(*value),
            _ => None,
        })
    }

    /// Looks up a text parameter by name.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.values.iter().find_map(|(n, v)| match v {
            ParamValue::Text(value) if *n == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Highest ids present in a freshly loaded dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamBounds {
    /// Largest user id.
    pub users: i64,
    /// Largest product id.
    pub products: i64,
    /// Largest review id.
    pub reviews: i64,
    /// Largest cart item id.
    pub cart_items: i64,
}

/// Key from which the parameters of one call are derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ParamKey {
    /// Sweep seed.
    pub seed: u64,
    /// Dataset tier.
    pub scale: Scale,
    /// Backend combination.
    pub variant: Variant,
    /// Catalog entry.
    pub query_id: QueryId,
    /// Call index within the cell, warm-up calls included.
    pub repetition: u32,
}

impl ParamKey {
    /// Deterministic RNG for this key.
    pub fn rng(&self) -> ChaCha8Rng {
        let mut bytes = [0u8; 18];
        bytes[0..8].copy_from_slice(&self.seed.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.scale.users().to_le_bytes());
        bytes[12] = self.variant.ordinal();
        bytes[13] = self.query_id.get();
        bytes[14..18].copy_from_slice(&self.repetition.to_le_bytes());
        ChaCha8Rng::seed_from_u64(xxh64(&bytes, 0))
    }
}

impl QueryDefinition {
    /// Draws the parameters for one call.
    pub fn bind(&self, key: ParamKey, bounds: &ParamBounds) -> QueryParams {
        let mut rng = key.rng();
        let mut params = QueryParams::empty();
        let mut pick = |upper: i64| rng.gen_range(1..=upper.max(1));
        match self.params {
            ParamSpec::None => {}
            ParamSpec::User => {
                params.push(":user_id", ParamValue::Int(pick(bounds.users)));
            }
            ParamSpec::UserStreet => {
                params.push(":user_id", ParamValue::Int(pick(bounds.users)));
                let tag = pick(i64::MAX);
                params.push(":street", ParamValue::Text(format!("Foo-{tag:016x}")));
            }
            ParamSpec::UserProduct => {
                params.push(":user_id", ParamValue::Int(pick(bounds.users)));
                params.push(":product_id", ParamValue::Int(pick(bounds.products)));
            }
            ParamSpec::Product => {
                params.push(":product_id", ParamValue::Int(pick(bounds.products)));
            }
            ParamSpec::ReviewPivot => {
                params.push(":review_pivot", ParamValue::Int(pick(bounds.reviews)));
            }
            ParamSpec::CartPivot => {
                params.push(":cart_pivot", ParamValue::Int(pick(bounds.cart_items)));
            }
        }
        params
    }
}

/// Looks up a catalog entry.
pub fn lookup(id: QueryId) -> &'static QueryDefinition {
    &CATALOG[usize::from(id.get()) - 1]
}

/// Every entry in id order.
pub fn entries() -> &'static [QueryDefinition] {
    &CATALOG
}

const fn entry(
    id: u8,
    complexity: Complexity,
    name: &'static str,
    sql: &'static str,
    params: ParamSpec,
) -> QueryDefinition {
    QueryDefinition {
        id: QueryId::fixed(id),
        complexity,
        name,
        sql,
        params,
    }
}

static CATALOG: [QueryDefinition; 24] = [
    entry(
        1,
        Complexity::SimpleRead,
        "product page",
        "SELECT id, name, price FROM products ORDER BY id LIMIT 50000",
        ParamSpec::None,
    ),
    entry(
        2,
        Complexity::SimpleRead,
        "category list",
        "SELECT id, name FROM categories ORDER BY id LIMIT 5000",
        ParamSpec::None,
    ),
    entry(
        3,
        Complexity::SimpleRead,
        "address list",
        "SELECT id, user_id, street, city FROM addresses ORDER BY id LIMIT 1000",
        ParamSpec::None,
    ),
    entry(
        4,
        Complexity::FilteredRead,
        "categorised products",
        "SELECT p.id, p.name FROM products p
         WHERE EXISTS (SELECT 1 FROM product_categories pc WHERE pc.product_id = p.id)
         ORDER BY p.id LIMIT 1000",
        ParamSpec::None,
    ),
    entry(
        5,
        Complexity::FilteredRead,
        "recent order lines",
        "SELECT o.id, oi.product_id, p.name, oi.quantity
         FROM (SELECT id FROM orders ORDER BY created_at DESC, id DESC LIMIT 20) o
         JOIN order_items oi ON oi.order_id = o.id
         JOIN products p ON p.id = oi.product_id
         ORDER BY o.id DESC, oi.id LIMIT 500",
        ParamSpec::None,
    ),
    entry(
        6,
        Complexity::FilteredRead,
        "latest reviews",
        "SELECT id, product_id, rating FROM reviews
         ORDER BY created_at DESC, id DESC LIMIT 100",
        ParamSpec::None,
    ),
    entry(
        7,
        Complexity::JoinRead,
        "cross-selling",
        "WITH top_prod AS (
        SELECT product_id FROM order_items
        GROUP BY product_id ORDER BY COUNT(*) DESC, product_id LIMIT 1),
     buyers AS (
        SELECT DISTINCT o.user_id FROM orders o
        JOIN order_items oi ON oi.order_id = o.id
        WHERE oi.product_id = (SELECT product_id FROM top_prod))
     SELECT oi.product_id, COUNT(*) AS times
     FROM orders o
     JOIN buyers b ON b.user_id = o.user_id
     JOIN order_items oi ON oi.order_id = o.id
     WHERE oi.product_id <> (SELECT product_id FROM top_prod)
     GROUP BY oi.product_id ORDER BY times DESC, oi.product_id LIMIT 100",
        ParamSpec::None,
    ),
    entry(
        8,
        Complexity::JoinRead,
        "co-occurrence pairs",
        "SELECT oi1.product_id AS a, oi2.product_id AS b,
                COUNT(DISTINCT oi1.order_id) AS together
         FROM order_items oi1
         JOIN order_items oi2
           ON oi2.order_id = oi1.order_id AND oi2.product_id > oi1.product_id
         GROUP BY a, b ORDER BY together DESC, a, b LIMIT 100",
        ParamSpec::None,
    ),
    entry(
        9,
        Complexity::JoinRead,
        "category affinity",
        "WITH top_prod AS (
        SELECT product_id FROM order_items
        GROUP BY product_id ORDER BY COUNT(*) DESC, product_id LIMIT 1),
     related AS (
        SELECT DISTINCT pc2.product_id FROM product_categories pc1
        JOIN product_categories pc2 ON pc2.category_id = pc1.category_id
        WHERE pc1.product_id = (SELECT product_id FROM top_prod)
          AND pc2.product_id <> pc1.product_id)
     SELECT r.product_id, COUNT(oi.id) AS lines
     FROM related r LEFT JOIN order_items oi ON oi.product_id = r.product_id
     GROUP BY r.product_id ORDER BY lines DESC, r.product_id LIMIT 100",
        ParamSpec::None,
    ),
    entry(
        10,
        Complexity::AggregateRead,
        "order totals",
        "SELECT o.id, SUM(oi.quantity * oi.unit_price) AS total
         FROM orders o JOIN order_items oi ON oi.order_id = o.id
         GROUP BY o.id ORDER BY o.id LIMIT 500",
        ParamSpec::None,
    ),
    entry(
        11,
        Complexity::AggregateRead,
        "top rated products",
        "SELECT p.id, AVG(r.rating) AS avg_rating
         FROM products p JOIN reviews r ON r.product_id = p.id
         GROUP BY p.id HAVING AVG(r.rating) > 4
         ORDER BY p.id LIMIT 1000",
        ParamSpec::None,
    ),
    entry(
        12,
        Complexity::AggregateRead,
        "recent orders per user",
        "SELECT user_id, COUNT(*) AS recent FROM orders
         WHERE created_at >= (SELECT anchor - 30 * 86400 FROM dataset_meta)
         GROUP BY user_id ORDER BY user_id LIMIT 500",
        ParamSpec::None,
    ),
    entry(
        13,
        Complexity::Create,
        "create address",
        "INSERT INTO addresses (user_id, street, city, zip)
         VALUES (:user_id, :street, 'Benchtown', '00000') RETURNING id",
        ParamSpec::UserStreet,
    ),
    entry(
        14,
        Complexity::Create,
        "create order",
        "INSERT INTO orders (user_id, created_at, status)
         VALUES (:user_id, CAST(strftime('%s', 'now') AS INTEGER), 'new') RETURNING id",
        ParamSpec::User,
    ),
    entry(
        15,
        Complexity::Create,
        "create cart item",
        "INSERT INTO cart_items (user_id, product_id, quantity, added_at)
         VALUES (:user_id, :product_id, 1, CAST(strftime('%s', 'now') AS INTEGER))
         RETURNING id",
        ParamSpec::UserProduct,
    ),
    entry(
        16,
        Complexity::Create,
        "create product view",
        "INSERT INTO product_views (user_id, product_id, viewed_at)
         VALUES (:user_id, :product_id, CAST(strftime('%s', 'now') AS INTEGER))
         RETURNING id",
        ParamSpec::UserProduct,
    ),
    entry(
        17,
        Complexity::Update,
        "restock product",
        "UPDATE products SET stock = stock + 1 WHERE id = :product_id RETURNING id",
        ParamSpec::Product,
    ),
    entry(
        18,
        Complexity::Update,
        "lower review rating",
        "UPDATE reviews SET rating = MAX(rating - 1, 1)
         WHERE id = (SELECT MIN(id) FROM reviews WHERE id >= :review_pivot)
         RETURNING id",
        ParamSpec::ReviewPivot,
    ),
    entry(
        19,
        Complexity::Update,
        "raise cart quantity",
        "UPDATE cart_items SET quantity = quantity + 3
         WHERE id = (SELECT MIN(id) FROM cart_items WHERE id >= :cart_pivot)
         RETURNING id",
        ParamSpec::CartPivot,
    ),
    entry(
        20,
        Complexity::Update,
        "mark user email",
        "UPDATE users SET email = email || '.tmp' WHERE id = :user_id RETURNING id",
        ParamSpec::User,
    ),
    entry(
        21,
        Complexity::Delete,
        "delete oldest address",
        "DELETE FROM addresses WHERE id = (SELECT MIN(id) FROM addresses) RETURNING id",
        ParamSpec::None,
    ),
    entry(
        22,
        Complexity::Delete,
        "delete oldest review",
        "DELETE FROM reviews WHERE id = (SELECT MIN(id) FROM reviews) RETURNING id",
        ParamSpec::None,
    ),
    entry(
        23,
        Complexity::Delete,
        "delete oldest cart item",
        "DELETE FROM cart_items WHERE id = (SELECT MIN(id) FROM cart_items) RETURNING id",
        ParamSpec::None,
    ),
    entry(
        24,
        Complexity::Delete,
        "delete oldest purchase",
        "DELETE FROM product_purchases
         WHERE id = (SELECT MIN(id) FROM product_purchases) RETURNING id",
        ParamSpec::None,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> ParamBounds {
        ParamBounds {
            users: 1_000,
            products: 2_000,
            reviews: 1_500,
            cart_items: 2_000,
        }
    }

    fn key(query: u8, repetition: u32) -> ParamKey {
        ParamKey {
            seed: 42,
            scale: Scale::Users1k,
            variant: Variant::RelationalNormal,
            query_id: QueryId::new(query).unwrap(),
            repetition,
        }
    }

    #[test]
    fn catalog_is_ordered_and_classified() {
        assert_eq!(entries().len(), 24);
        for (index, def) in entries().iter().enumerate() {
            assert_eq!(usize::from(def.id.get()), index + 1);
            assert_eq!(def.complexity, Complexity::of(def.id));
        }
        assert!(entries()[6].sql.starts_with("WITH top_prod"));
        assert!(entries()[8].sql.starts_with("WITH top_prod"));
    }

    #[test]
    fn statements_name_exactly_their_parameters() {
        for def in entries() {
            let params = def.bind(key(def.id.get(), 0), &bounds());
            for (name, _) in params.iter() {
                assert!(def.sql.contains(name), "query {} misses {name}", def.id);
            }
            assert_eq!(def.params == ParamSpec::None, params.is_empty());
        }
    }

    #[test]
    fn binding_is_reproducible_per_key() {
        let def = lookup(QueryId::new(13).unwrap());
        let first = def.bind(key(13, 4), &bounds());
        let again = def.bind(key(13, 4), &bounds());
        let other = def.bind(key(13, 5), &bounds());
        assert_eq!(first, again);
        assert_ne!(first, other);
        let user = first.int(":user_id").unwrap();
        assert!((1..=1_000).contains(&user));
        assert!(first.text(":street").unwrap().starts_with("Foo-"));
    }

    #[test]
    fn variant_changes_the_stream() {
        let def = lookup(QueryId::new(17).unwrap());
        let mut graph = key(17, 0);
        graph.variant = Variant::GraphOptimized;
        let a: Vec<_> = (0..8)
            .map(|rep| def.bind(ParamKey { repetition: rep, ..key(17, 0) }, &bounds()))
            .collect();
        let b: Vec<_> = (0..8)
            .map(|rep| def.bind(ParamKey { repetition: rep, ..graph }, &bounds()))
            .collect();
        assert_ne!(a, b);
    }

    #[test]
    fn declared_names_match_bound_parameters() {
        for def in entries() {
            let params = def.bind(key(def.id.get(), 0), &bounds());
            let bound: Vec<_> = params.iter().map(|(name, _)| name).collect();
            assert_eq!(bound, def.params.names(), "query {}", def.id);
        }
    }
}
