//! Fixed-shape e-commerce dataset, generated once per scale tier and loaded
//! into every backend before the first cell of that tier runs.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::catalog::ParamBounds;
use crate::model::Scale;

const DAY_SECS: i64 = 86_400;

/// Reference instant of generated datasets, 2025-01-01T00:00:00Z.
pub const GENERATION_ANCHOR: i64 = 1_735_689_600;

/// Dataset production or loading failure.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The dataset file could not be read or written.
    #[error("dataset file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The dataset file is not valid JSON for this shape.
    #[error("dataset file {path} is malformed: {source}")]
    Malformed {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// The file holds a dataset for another tier.
    #[error("dataset file {path} holds {found} users, expected {expected}")]
    ScaleMismatch {
        /// File involved.
        path: PathBuf,
        /// Users required by the tier.
        expected: usize,
        /// Users found in the file.
        found: usize,
    },
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub created_at: i64,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub price: f64,
    pub stock: i64,
}

#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCategory {
    pub product_id: i64,
    pub category_id: i64,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub user_id: i64,
    pub street: String,
    pub city: String,
    pub zip: String,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub created_at: i64,
    pub status: String,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub unit_price: f64,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub rating: i64,
    pub body: String,
    pub created_at: i64,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub quantity: i64,
    pub added_at: i64,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductView {
    pub id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub viewed_at: i64,
}

#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductPurchase {
    pub id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub purchased_at: i64,
}

/// Every table of the workload. Ids are dense and start at 1.
#[allow(missing_docs)]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Unix time the dataset treats as "now". Timestamps fall in the year
    /// before it and recency windows are measured back from it.
    pub anchor: i64,
    pub users: Vec<User>,
    pub categories: Vec<Category>,
    pub products: Vec<Product>,
    pub product_categories: Vec<ProductCategory>,
    pub addresses: Vec<Address>,
    pub orders: Vec<Order>,
    pub order_items: Vec<OrderItem>,
    pub reviews: Vec<Review>,
    pub cart_items: Vec<CartItem>,
    pub product_views: Vec<ProductView>,
    pub product_purchases: Vec<ProductPurchase>,
}

impl Dataset {
    /// Generates the dataset for a tier, anchored at [`GENERATION_ANCHOR`].
    pub fn generate(scale: Scale, seed: u64) -> Self {
        Self::generate_at(scale.users() as usize, seed, GENERATION_ANCHOR)
    }

    /// Generates `users` users with timestamps in the year before `anchor`.
    pub fn generate_at(users: usize, seed: u64, anchor: i64) -> Self {
        let mut gen = Generator {
            rng: ChaCha8Rng::seed_from_u64(seed),
            anchor,
            data: Dataset {
                anchor,
                ..Dataset::default()
            },
        };
        gen.users(users);
        gen.catalog(users);
        gen.addresses();
        gen.orders();
        gen.activity();
        gen.data
    }

    /// Number of users.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Id ranges used to draw write-query parameters.
    pub fn bounds(&self) -> ParamBounds {
        fn last<T>(rows: &[T], id: impl Fn(&T) -> i64) -> i64 {
            rows.last().map(id).unwrap_or(0)
        }
        ParamBounds {
            users: last(&self.users, |u| u.id),
            products: last(&self.products, |p| p.id),
            reviews: last(&self.reviews, |r| r.id),
            cart_items: last(&self.cart_items, |c| c.id),
        }
    }

    /// Rows in the smallest table a delete query drains.
    pub fn delete_capacity(&self) -> usize {
        [
            self.addresses.len(),
            self.reviews.len(),
            self.cart_items.len(),
            self.product_purchases.len(),
        ]
        .into_iter()
        .min()
        .unwrap_or(0)
    }

    /// Canonical file name for a tier.
    pub fn file_name(scale: Scale) -> String {
        format!("ecommerce_{}.json", scale.users())
    }

    /// Writes the dataset as JSON.
    pub fn save_json(&self, path: &Path) -> Result<(), DatasetError> {
        let io_err = |source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = fs::File::create(path).map_err(io_err)?;
        serde_json::to_writer(BufWriter::new(file), self).map_err(|source| {
            DatasetError::Malformed {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Reads a dataset written by [`Dataset::save_json`].
    pub fn load_json(path: &Path) -> Result<Self, DatasetError> {
        let file = fs::File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| DatasetError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `ecommerce_<users>.json` from `dir` when present, otherwise
    /// generates the tier in memory.
    pub fn load_or_generate(
        dir: Option<&Path>,
        scale: Scale,
        seed: u64,
    ) -> Result<Self, DatasetError> {
        if let Some(dir) = dir {
            let path = dir.join(Self::file_name(scale));
            if path.exists() {
                let data = Self::load_json(&path)?;
                if data.user_count() != scale.users() as usize {
                    return Err(DatasetError::ScaleMismatch {
                        path,
                        expected: scale.users() as usize,
                        found: data.user_count(),
                    });
                }
                info!(path = %path.display(), users = data.user_count(), "loaded dataset");
                return Ok(data);
            }
        }
        let data = Self::generate(scale, seed);
        info!(
            users = data.users.len(),
            products = data.products.len(),
            orders = data.orders.len(),
            "generated dataset"
        );
        Ok(data)
    }
}

struct Generator {
    rng: ChaCha8Rng,
    anchor: i64,
    data: Dataset,
}

impl Generator {
    fn past(&mut self) -> i64 {
        self.anchor - self.rng.gen_range(0..365 * DAY_SECS)
    }

    fn users(&mut self, count: usize) {
        for i in 0..count {
            let id = i as i64 + 1;
            let created_at = self.past();
            self.data.users.push(User {
                id,
                name: format!("User {id}"),
                email: format!("user{id}@example.com"),
                created_at,
            });
        }
    }

    fn catalog(&mut self, users: usize) {
        let categories = (users / 50).max(8);
        for i in 0..categories {
            let id = i as i64 + 1;
            self.data.categories.push(Category {
                id,
                name: format!("Category {id}"),
            });
        }
        for i in 0..users * 2 {
            let id = i as i64 + 1;
            let price = (self.rng.gen_range(100..50_000) as f64) / 100.0;
            let stock = self.rng.gen_range(0..500);
            self.data.products.push(Product {
                id,
                name: format!("Product {id}"),
                price,
                stock,
            });
            let first = self.rng.gen_range(1..=categories as i64);
            self.data.product_categories.push(ProductCategory {
                product_id: id,
                category_id: first,
            });
            if self.rng.gen_bool(0.5) {
                let second = self.rng.gen_range(1..=categories as i64);
                if second != first {
                    self.data.product_categories.push(ProductCategory {
                        product_id: id,
                        category_id: second,
                    });
                }
            }
        }
    }

    fn addresses(&mut self) {
        for u in 0..self.data.users.len() {
            let user_id = self.data.users[u].id;
            let roll = self.rng.gen_range(0..100);
            let count = match roll {
                0..=69 => 1,
                70..=94 => 2,
                _ => 3,
            };
            for _ in 0..count {
                let id = self.data.addresses.len() as i64 + 1;
                let number = self.rng.gen_range(1..999);
                let zip = format!("{:05}", self.rng.gen_range(0..100_000));
                self.data.addresses.push(Address {
                    id,
                    user_id,
                    street: format!("{number} Market Street"),
                    city: format!("City {}", self.rng.gen_range(1..200)),
                    zip,
                });
            }
        }
    }

    fn orders(&mut self) {
        let product_count = self.data.products.len();
        let product_ids: Vec<i64> = (1..=product_count as i64).collect();
        for u in 0..self.data.users.len() {
            let user_id = self.data.users[u].id;
            for _ in 0..self.rng.gen_range(1..=3) {
                let order_id = self.data.orders.len() as i64 + 1;
                let created_at = self.past();
                let status = ["new", "paid", "shipped", "delivered"]
                    .choose(&mut self.rng)
                    .copied()
                    .unwrap_or("new");
                self.data.orders.push(Order {
                    id: order_id,
                    user_id,
                    created_at,
                    status: status.to_string(),
                });
                let lines = self.rng.gen_range(1..=4).min(product_count);
                let picked: Vec<i64> = product_ids
                    .choose_multiple(&mut self.rng, lines)
                    .copied()
                    .collect();
                for product_id in picked {
                    let unit_price = self.data.products[(product_id - 1) as usize].price;
                    let item_id = self.data.order_items.len() as i64 + 1;
                    self.data.order_items.push(OrderItem {
                        id: item_id,
                        order_id,
                        product_id,
                        quantity: self.rng.gen_range(1..=3),
                        unit_price,
                    });
                    let purchase_id = self.data.product_purchases.len() as i64 + 1;
                    self.data.product_purchases.push(ProductPurchase {
                        id: purchase_id,
                        user_id,
                        product_id,
                        purchased_at: created_at,
                    });
                }
            }
        }
    }

    // Reviews of purchased products, carts and browsing history. Every user
    // contributes at least one row to each table drained by delete queries.
    fn activity(&mut self) {
        let product_count = self.data.products.len() as i64;
        let mut purchased: Vec<Vec<i64>> = vec![Vec::new(); self.data.users.len()];
        for purchase in &self.data.product_purchases {
            purchased[(purchase.user_id - 1) as usize].push(purchase.product_id);
        }
        for (index, bought) in purchased.iter().enumerate() {
            let user_id = index as i64 + 1;
            let reviews = self.rng.gen_range(1..=2);
            for _ in 0..reviews {
                let product_id = bought
                    .choose(&mut self.rng)
                    .copied()
                    .unwrap_or_else(|| self.rng.gen_range(1..=product_count));
                let created_at = self.past();
                let id = self.data.reviews.len() as i64 + 1;
                let rating = self.rng.gen_range(1..=5);
                self.data.reviews.push(Review {
                    id,
                    user_id,
                    product_id,
                    rating,
                    body: format!("Rated {rating} of 5"),
                    created_at,
                });
            }
            for _ in 0..self.rng.gen_range(1..=3) {
                let id = self.data.cart_items.len() as i64 + 1;
                let product_id = self.rng.gen_range(1..=product_count);
                let quantity = self.rng.gen_range(1..=5);
                let added_at = self.past();
                self.data.cart_items.push(CartItem {
                    id,
                    user_id,
                    product_id,
                    quantity,
                    added_at,
                });
            }
            for _ in 0..self.rng.gen_range(1..=10) {
                let id = self.data.product_views.len() as i64 + 1;
                let product_id = self.rng.gen_range(1..=product_count);
                let viewed_at = self.past();
                self.data.product_views.push(ProductView {
                    id,
                    user_id,
                    product_id,
                    viewed_at,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const ANCHOR: i64 = 1_760_000_000;

    #[test]
    fn generation_is_deterministic() {
        let a = Dataset::generate_at(200, 9, ANCHOR);
        let b = Dataset::generate_at(200, 9, ANCHOR);
        assert_eq!(a, b);
        assert_ne!(a, Dataset::generate_at(200, 10, ANCHOR));
    }

    #[test]
    fn tiers_do_not_depend_on_the_wall_clock() {
        let data = Dataset::generate(Scale::Users1k, 4);
        assert_eq!(data.anchor, GENERATION_ANCHOR);
        assert!(data.orders.iter().all(|o| o.created_at <= GENERATION_ANCHOR));
        assert_eq!(data, Dataset::generate(Scale::Users1k, 4));
    }

    #[test]
    fn shape_and_integrity() {
        let data = Dataset::generate_at(300, 1, ANCHOR);
        assert_eq!(data.users.len(), 300);
        assert_eq!(data.products.len(), 600);
        assert_eq!(data.categories.len(), 8);
        assert!(data.delete_capacity() >= 300);
        let products: HashSet<i64> = data.products.iter().map(|p| p.id).collect();
        let orders: HashSet<i64> = data.orders.iter().map(|o| o.id).collect();
        for item in &data.order_items {
            assert!(products.contains(&item.product_id));
            assert!(orders.contains(&item.order_id));
        }
        for pc in &data.product_categories {
            assert!((1..=8).contains(&pc.category_id));
        }
        assert!(data
            .orders
            .iter()
            .all(|o| o.created_at <= ANCHOR && o.created_at > ANCHOR - 365 * DAY_SECS));
        let bounds = data.bounds();
        assert_eq!(bounds.users, 300);
        assert_eq!(bounds.products, 600);
        assert_eq!(bounds.reviews, data.reviews.len() as i64);
    }

    #[test]
    fn order_lines_use_distinct_products() {
        let data = Dataset::generate_at(100, 4, ANCHOR);
        let mut seen = HashSet::new();
        for item in &data.order_items {
            assert!(seen.insert((item.order_id, item.product_id)));
        }
    }

    #[test]
    fn json_round_trip_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let data = Dataset::generate_at(1_000, 2, ANCHOR);
        data.save_json(&dir.path().join(Dataset::file_name(Scale::Users1k)))
            .unwrap();
        let loaded = Dataset::load_or_generate(Some(dir.path()), Scale::Users1k, 99).unwrap();
        assert_eq!(loaded, data);
        assert_eq!(loaded.anchor, ANCHOR);

        let err = Dataset::load_or_generate(Some(dir.path()), Scale::Users10k, 99);
        assert!(err.is_ok(), "missing tier file falls back to generation");
    }

    #[test]
    fn wrong_tier_in_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = Dataset::generate_at(10, 2, ANCHOR);
        data.save_json(&dir.path().join(Dataset::file_name(Scale::Users1k)))
            .unwrap();
        let err = Dataset::load_or_generate(Some(dir.path()), Scale::Users1k, 1).unwrap_err();
        assert!(matches!(err, DatasetError::ScaleMismatch { found: 10, .. }));
    }
}
