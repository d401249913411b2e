//! Query descriptors: filter, ordering and pagination over one collection.
//!
//! Evaluation is deterministic: entities are ordered by the requested field
//! (using [`compare_values`], a total order over JSON values) and ties are
//! broken by entity id.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Entity;
use crate::types::{CollectionName, Fields};

static NULL: Value = Value::Null;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Predicate over an entity's fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Le(String, Value),
    Gt(String, Value),
    Ge(String, Value),
    /// String field contains the substring, or array field contains the value.
    Contains(String, Value),
    Exists(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Evaluate the predicate. A missing field compares as `null`.
    pub fn matches(&self, fields: &Fields) -> bool {
        let get = |name: &str| fields.get(name).unwrap_or(&NULL);
        match self {
            Filter::Eq(f, v) => get(f) == v,
            Filter::Ne(f, v) => get(f) != v,
            Filter::Lt(f, v) => comparable(get(f), v) == Some(Ordering::Less),
            Filter::Le(f, v) => matches!(
                comparable(get(f), v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gt(f, v) => comparable(get(f), v) == Some(Ordering::Greater),
            Filter::Ge(f, v) => matches!(
                comparable(get(f), v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Contains(f, v) => match (get(f), v) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            Filter::Exists(f) => fields.get(f).is_some_and(|v| !v.is_null()),
            Filter::And(all) => all.iter().all(|p| p.matches(fields)),
            Filter::Or(any) => any.iter().any(|p| p.matches(fields)),
            Filter::Not(inner) => !inner.matches(fields),
        }
    }
}

/// Range comparisons only hold between values of the same JSON type.
fn comparable(a: &Value, b: &Value) -> Option<Ordering> {
    if type_rank(a) == type_rank(b) && !a.is_null() {
        Some(compare_values(a, b))
    } else {
        None
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| compare_values(l, r))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y)
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| compare_values(lv, rv)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// A query descriptor over one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: CollectionName,
    pub filter: Option<Filter>,
    pub order_by: Option<OrderBy>,
    /// Maximum number of entities in the window. `None` = unbounded.
    pub page_size: Option<usize>,
    /// Entities skipped before the window starts.
    pub offset: usize,
}

impl Query {
    /// All entities of a collection, ordered by id.
    pub fn collection(collection: impl Into<CollectionName>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
            order_by: None,
            page_size: None,
            offset: 0,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Whether an entity belongs to the result set (ignoring the window).
    pub fn matches(&self, entity: &Entity) -> bool {
        entity.key.collection == self.collection
            && self
                .filter
                .as_ref()
                .map_or(true, |f| f.matches(&entity.fields))
    }

    /// Evaluate the query over a set of entities.
    pub fn evaluate<'a, I>(&self, entities: I) -> Vec<Entity>
    where
        I: IntoIterator<Item = &'a Entity>,
    {
        let mut hits: Vec<&Entity> = entities.into_iter().filter(|e| self.matches(e)).collect();

        hits.sort_by(|a, b| {
            let primary = match &self.order_by {
                Some(order) => {
                    let l = a.fields.get(&order.field).unwrap_or(&NULL);
                    let r = b.fields.get(&order.field).unwrap_or(&NULL);
                    match order.direction {
                        Direction::Ascending => compare_values(l, r),
                        Direction::Descending => compare_values(r, l),
                    }
                }
                None => Ordering::Equal,
            };
            primary.then_with(|| a.key.id.cmp(&b.key.id))
        });

        hits.into_iter()
            .skip(self.offset)
            .take(self.page_size.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}
